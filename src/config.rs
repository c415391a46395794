//! # Configuration Resolution
//!
//! Uniform lookup for a fixed set of options, resolved in order:
//!
//! 1. Process environment, each key prefixed with `MINIOTST_`
//!    (e.g. `MINIOTST_DOWNLOAD_DIR`).
//! 2. The project manifest: the first `Cargo.toml` found walking upward
//!    from the working directory whose
//!    `[package.metadata.minio-test-server]` table is non-empty. Manifest
//!    keys are camelCase (`downloadDir`); path-valued entries are resolved
//!    against the manifest's directory.
//! 3. A built-in defaults table.
//!
//! ```toml
//! [package.metadata.minio-test-server]
//! version = "7.0.14"
//! downloadDir = "target/minio-binaries"
//! md5Check = true
//! ```
//!
//! Boolean values parse from `1`, `on`, `yes`, `true` (case-insensitive);
//! anything else is false.
//!
//! The resolver snapshots the environment at construction, so tests can
//! inject both environment and manifest without mutating process globals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::{ENV_PREFIX, MANIFEST_FILE, MANIFEST_METADATA_KEY};

// =============================================================================
// Config Keys
// =============================================================================

/// The fixed enumeration of recognized options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Directory binaries are downloaded to and located in.
    DownloadDir,
    /// Platform override (`linux`, `darwin`, `win32`).
    Platform,
    /// Architecture override (`x64`, `arm64`, ...).
    Arch,
    /// Server version to provision.
    Version,
    /// Enables debug-level diagnostics in the hosting program.
    Debug,
    /// Mirror base URL replacing the official release index.
    DownloadMirror,
    /// Full download URL, used verbatim.
    DownloadUrl,
    /// Prefer the global home cache over the project-local cache.
    PreferGlobalPath,
    /// Hosting programs skip their install-time cache priming when set.
    DisablePostinstall,
    /// Absolute path to a pre-installed server binary.
    SystemBinary,
    /// Verify the archive against its published MD5 sidecar.
    Md5Check,
    /// Explicit archive name overriding the derived one.
    ArchiveName,
    /// Allow downloading at runtime when no cached binary exists.
    RuntimeDownload,
    /// Force plain `http` for downloads.
    UseHttp,
    /// Hosting programs verify the system binary's version when set.
    SystemBinaryVersionCheck,
    /// Derive the on-disk binary name from the archive name.
    UseArchiveNameForBinaryName,
    /// Redirect cap for downloads.
    MaxRedirects,
    /// Distro override for the Linux distro-family mapping.
    Distro,
}

impl ConfigKey {
    /// Every recognized key, for iteration in diagnostics.
    pub const ALL: &'static [ConfigKey] = &[
        ConfigKey::DownloadDir,
        ConfigKey::Platform,
        ConfigKey::Arch,
        ConfigKey::Version,
        ConfigKey::Debug,
        ConfigKey::DownloadMirror,
        ConfigKey::DownloadUrl,
        ConfigKey::PreferGlobalPath,
        ConfigKey::DisablePostinstall,
        ConfigKey::SystemBinary,
        ConfigKey::Md5Check,
        ConfigKey::ArchiveName,
        ConfigKey::RuntimeDownload,
        ConfigKey::UseHttp,
        ConfigKey::SystemBinaryVersionCheck,
        ConfigKey::UseArchiveNameForBinaryName,
        ConfigKey::MaxRedirects,
        ConfigKey::Distro,
    ];

    /// SCREAMING_SNAKE name as it appears after the env prefix.
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::DownloadDir => "DOWNLOAD_DIR",
            ConfigKey::Platform => "PLATFORM",
            ConfigKey::Arch => "ARCH",
            ConfigKey::Version => "VERSION",
            ConfigKey::Debug => "DEBUG",
            ConfigKey::DownloadMirror => "DOWNLOAD_MIRROR",
            ConfigKey::DownloadUrl => "DOWNLOAD_URL",
            ConfigKey::PreferGlobalPath => "PREFER_GLOBAL_PATH",
            ConfigKey::DisablePostinstall => "DISABLE_POSTINSTALL",
            ConfigKey::SystemBinary => "SYSTEM_BINARY",
            ConfigKey::Md5Check => "MD5_CHECK",
            ConfigKey::ArchiveName => "ARCHIVE_NAME",
            ConfigKey::RuntimeDownload => "RUNTIME_DOWNLOAD",
            ConfigKey::UseHttp => "USE_HTTP",
            ConfigKey::SystemBinaryVersionCheck => "SYSTEM_BINARY_VERSION_CHECK",
            ConfigKey::UseArchiveNameForBinaryName => "USE_ARCHIVE_NAME_FOR_BINARY_NAME",
            ConfigKey::MaxRedirects => "MAX_REDIRECTS",
            ConfigKey::Distro => "DISTRO",
        }
    }

    /// Full environment variable name.
    pub fn env_name(self) -> String {
        format!("{}{}", ENV_PREFIX, self.name())
    }

    /// camelCase key used in the manifest metadata table.
    pub fn manifest_key(self) -> &'static str {
        match self {
            ConfigKey::DownloadDir => "downloadDir",
            ConfigKey::Platform => "platform",
            ConfigKey::Arch => "arch",
            ConfigKey::Version => "version",
            ConfigKey::Debug => "debug",
            ConfigKey::DownloadMirror => "downloadMirror",
            ConfigKey::DownloadUrl => "downloadUrl",
            ConfigKey::PreferGlobalPath => "preferGlobalPath",
            ConfigKey::DisablePostinstall => "disablePostinstall",
            ConfigKey::SystemBinary => "systemBinary",
            ConfigKey::Md5Check => "md5Check",
            ConfigKey::ArchiveName => "archiveName",
            ConfigKey::RuntimeDownload => "runtimeDownload",
            ConfigKey::UseHttp => "useHttp",
            ConfigKey::SystemBinaryVersionCheck => "systemBinaryVersionCheck",
            ConfigKey::UseArchiveNameForBinaryName => "useArchiveNameForBinaryName",
            ConfigKey::MaxRedirects => "maxRedirects",
            ConfigKey::Distro => "distro",
        }
    }

    /// Built-in default, if any.
    pub fn default_value(self) -> Option<&'static str> {
        match self {
            ConfigKey::Version => Some(crate::constants::DEFAULT_VERSION),
            ConfigKey::PreferGlobalPath => Some("true"),
            ConfigKey::RuntimeDownload => Some("true"),
            ConfigKey::UseHttp => Some("false"),
            ConfigKey::SystemBinaryVersionCheck => Some("true"),
            ConfigKey::UseArchiveNameForBinaryName => Some("false"),
            ConfigKey::MaxRedirects => Some("2"),
            _ => None,
        }
    }

    /// Whether a manifest value for this key is a path to absolutize.
    fn is_manifest_path(self) -> bool {
        matches!(self, ConfigKey::DownloadDir | ConfigKey::SystemBinary)
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// A discovered project manifest: its directory plus the flattened
/// metadata table, keyed by camelCase option name.
#[derive(Debug, Clone)]
pub struct Manifest {
    dir: PathBuf,
    values: HashMap<String, String>,
}

impl Manifest {
    /// Parses manifest contents; returns `None` when the metadata table
    /// is absent or empty.
    fn parse(dir: &Path, contents: &str) -> Option<Self> {
        let doc: toml::Value = match toml::from_str(contents) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "skipping unparseable manifest");
                return None;
            }
        };

        let table = doc
            .get("package")?
            .get("metadata")?
            .get(MANIFEST_METADATA_KEY)?
            .as_table()?;

        if table.is_empty() {
            return None;
        }

        let mut values = HashMap::with_capacity(table.len());
        for (key, value) in table {
            let stringified = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Integer(i) => i.to_string(),
                other => {
                    warn!(key = %key, value = %other, "ignoring non-scalar manifest value");
                    continue;
                }
            };
            values.insert(key.clone(), stringified);
        }

        if values.is_empty() {
            return None;
        }

        Some(Self {
            dir: dir.to_path_buf(),
            values,
        })
    }

    /// Walks upward from `start`, returning the first manifest with a
    /// non-empty metadata table.
    pub fn discover(start: &Path) -> Option<Self> {
        let mut dir = Some(start);
        while let Some(current) = dir {
            let candidate = current.join(MANIFEST_FILE);
            if let Ok(contents) = std::fs::read_to_string(&candidate) {
                if let Some(manifest) = Self::parse(current, &contents) {
                    debug!(manifest = %candidate.display(), "using project manifest");
                    return Some(manifest);
                }
            }
            dir = current.parent();
        }
        None
    }

    fn get(&self, key: ConfigKey) -> Option<String> {
        let raw = self.values.get(key.manifest_key())?;
        if key.is_manifest_path() {
            let path = Path::new(raw);
            if path.is_relative() {
                return Some(self.dir.join(path).to_string_lossy().into_owned());
            }
        }
        Some(raw.clone())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves configuration values from environment, manifest and defaults.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    env: HashMap<String, String>,
    manifest: Option<Manifest>,
}

impl ConfigResolver {
    /// Builds a resolver from the process environment and the manifest
    /// discovered upward from the current working directory.
    pub fn from_process() -> Self {
        let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            env: std::env::vars().collect(),
            manifest: Manifest::discover(&start),
        }
    }

    /// Builds a resolver over an explicit environment snapshot and an
    /// optional pre-discovered manifest. Tests use this to avoid process
    /// global mutation.
    pub fn with_env_and_manifest(
        env: HashMap<String, String>,
        manifest: Option<Manifest>,
    ) -> Self {
        Self { env, manifest }
    }

    /// Discovers a manifest from an explicit start directory.
    pub fn manifest_from(start: &Path) -> Option<Manifest> {
        Manifest::discover(start)
    }

    /// Resolves a key through env, then manifest, then defaults.
    pub fn resolve(&self, key: ConfigKey) -> Option<String> {
        if let Some(value) = self.env.get(&key.env_name()) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
        if let Some(manifest) = &self.manifest {
            if let Some(value) = manifest.get(key) {
                return Some(value);
            }
        }
        key.default_value().map(str::to_owned)
    }

    /// Resolves a boolean key; unset resolves to false.
    pub fn resolve_bool(&self, key: ConfigKey) -> bool {
        self.resolve(key).map(|v| parse_bool(&v)).unwrap_or(false)
    }

    /// Resolves a numeric key, falling back to `default` on absence or
    /// an unparseable value.
    pub fn resolve_number(&self, key: ConfigKey, default: usize) -> usize {
        match self.resolve(key) {
            Some(raw) => match raw.trim().parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!(key = key.name(), value = %raw, "ignoring non-numeric config value");
                    default
                }
            },
            None => default,
        }
    }

    /// Resolves a path-valued key.
    pub fn resolve_path(&self, key: ConfigKey) -> Option<PathBuf> {
        self.resolve(key).map(PathBuf::from)
    }

    /// Whether debug diagnostics were requested via `MINIOTST_DEBUG`.
    pub fn debug_enabled(&self) -> bool {
        self.resolve_bool(ConfigKey::Debug)
    }

    /// The effective redirect cap for downloads.
    pub fn max_redirects(&self) -> usize {
        self.resolve_number(
            ConfigKey::MaxRedirects,
            crate::constants::DEFAULT_MAX_REDIRECTS,
        )
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::from_process()
    }
}

/// Parses the accepted truthy spellings; everything else is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "on" | "yes" | "true"
    )
}

/// Convenience: resolve a key against a fresh process-backed resolver.
pub fn resolve(key: ConfigKey) -> Option<String> {
    ConfigResolver::from_process().resolve(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_wins_over_default() {
        let resolver = ConfigResolver::with_env_and_manifest(
            env(&[("MINIOTST_VERSION", "6.0.1")]),
            None,
        );
        assert_eq!(resolver.resolve(ConfigKey::Version).as_deref(), Some("6.0.1"));
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let resolver = ConfigResolver::with_env_and_manifest(HashMap::new(), None);
        assert_eq!(
            resolver.resolve(ConfigKey::Version).as_deref(),
            Some(crate::constants::DEFAULT_VERSION)
        );
        assert!(resolver.resolve_bool(ConfigKey::PreferGlobalPath));
        assert!(resolver.resolve_bool(ConfigKey::RuntimeDownload));
        assert!(!resolver.resolve_bool(ConfigKey::UseHttp));
        assert_eq!(resolver.max_redirects(), 2);
        assert_eq!(resolver.resolve(ConfigKey::DownloadDir), None);
    }

    #[test]
    fn test_empty_env_value_falls_through() {
        let resolver = ConfigResolver::with_env_and_manifest(
            env(&[("MINIOTST_VERSION", "")]),
            None,
        );
        assert_eq!(
            resolver.resolve(ConfigKey::Version).as_deref(),
            Some(crate::constants::DEFAULT_VERSION)
        );
    }

    #[test]
    fn test_bool_parsing_spellings() {
        for truthy in ["1", "on", "YES", "True", " true "] {
            assert!(parse_bool(truthy), "{truthy:?} should parse true");
        }
        for falsy in ["0", "off", "no", "false", "2", ""] {
            assert!(!parse_bool(falsy), "{falsy:?} should parse false");
        }
    }

    #[test]
    fn test_manifest_parse_and_path_resolution() {
        let manifest = Manifest::parse(
            Path::new("/proj"),
            r#"
            [package]
            name = "demo"
            version = "0.1.0"

            [package.metadata.minio-test-server]
            version = "6.0.1"
            downloadDir = "cache/bin"
            md5Check = true
            maxRedirects = 4
            "#,
        )
        .expect("metadata table should parse");

        let resolver = ConfigResolver::with_env_and_manifest(HashMap::new(), Some(manifest));
        assert_eq!(resolver.resolve(ConfigKey::Version).as_deref(), Some("6.0.1"));
        assert_eq!(
            resolver.resolve(ConfigKey::DownloadDir).as_deref(),
            Some("/proj/cache/bin")
        );
        assert!(resolver.resolve_bool(ConfigKey::Md5Check));
        assert_eq!(resolver.max_redirects(), 4);
    }

    #[test]
    fn test_manifest_empty_table_is_skipped() {
        let parsed = Manifest::parse(
            Path::new("/proj"),
            r#"
            [package]
            name = "demo"

            [package.metadata.minio-test-server]
            "#,
        );
        assert!(parsed.is_none(), "empty metadata table should not count");
    }

    #[test]
    fn test_env_beats_manifest() {
        let manifest = Manifest::parse(
            Path::new("/proj"),
            "[package.metadata.minio-test-server]\nversion = \"5.0.0\"\n",
        )
        .unwrap();
        let resolver = ConfigResolver::with_env_and_manifest(
            env(&[("MINIOTST_VERSION", "6.0.1")]),
            Some(manifest),
        );
        assert_eq!(resolver.resolve(ConfigKey::Version).as_deref(), Some("6.0.1"));
    }
}
