//! # Artifact Resolution
//!
//! Maps `(version, os, arch, distro, release)` to the archive URL and the
//! canonical on-disk binary name.
//!
//! ## URL Shape
//!
//! ```text
//! <mirror>/<platform>-<arch>/archive/<version>
//! ```
//!
//! with the mirror defaulting to the official release index. A configured
//! `DOWNLOAD_URL` short-circuits everything and is used verbatim.
//!
//! ## Naming
//!
//! The default binary name is `mongod-<arch>-<distro-or-os>-<version>`
//! (`.exe` on Windows) - the legacy stem is kept so existing caches stay
//! valid. When `USE_ARCHIVE_NAME_FOR_BINARY_NAME` is set (or an explicit
//! `ARCHIVE_NAME` is supplied) the binary takes the archive's stem
//! instead.
//!
//! ## Distro Families
//!
//! Linux distro strings dispatch through a static table of
//! `(regex predicate, family mapping)` pairs, matched against the probed
//! distro id and each `id_like` entry in order. Each family applies its
//! own version-aware corrections; see the tables on the mapping
//! functions.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;
use tracing::warn;
use url::Url;

use crate::config::{ConfigKey, ConfigResolver};
use crate::constants::DEFAULT_MIRROR;
use crate::error::{Error, Result};
use crate::platform::{self, OsInfo};

// =============================================================================
// Version Handling
// =============================================================================

/// Pattern marking a version request as "always latest": lower-bound
/// checks are suppressed because the artifact tracks the newest release.
fn always_latest_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^v\d+\.\d+-latest$").unwrap())
}

/// A requested server version: the raw string plus its coerced semver
/// form, or the "always latest" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    raw: String,
    parsed: Option<Version>,
    always_latest: bool,
}

impl ServerVersion {
    /// Coerces a free-form version string.
    ///
    /// Accepts full semver, partial versions (`"5.0"` → `5.0.0`), an
    /// optional leading `v`, and the `v<major>.<minor>-latest` sentinel.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if always_latest_re().is_match(trimmed) {
            return Ok(Self {
                raw: trimmed.to_string(),
                parsed: None,
                always_latest: true,
            });
        }

        let candidate = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        if let Ok(version) = Version::parse(candidate) {
            return Ok(Self {
                raw: trimmed.to_string(),
                parsed: Some(version),
                always_latest: false,
            });
        }

        // Pad partial versions: "5", "5.0".
        static PARTIAL: OnceLock<Regex> = OnceLock::new();
        let partial = PARTIAL
            .get_or_init(|| Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?$").unwrap());
        let caps = partial
            .captures(candidate)
            .ok_or_else(|| Error::UncoercibleVersion(raw.to_string()))?;
        let part = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().parse::<u64>().unwrap_or(0))
                .unwrap_or(0)
        };

        Ok(Self {
            raw: trimmed.to_string(),
            parsed: Some(Version::new(part(1), part(2), part(3))),
            always_latest: false,
        })
    }

    /// The raw string, as used in URLs and file names.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether this request tracks the newest release.
    pub fn is_always_latest(&self) -> bool {
        self.always_latest
    }

    /// True when the version is at least `major.minor.patch`. Always
    /// true for "always latest" requests.
    pub fn at_least(&self, major: u64, minor: u64, patch: u64) -> bool {
        match &self.parsed {
            Some(v) => *v >= Version::new(major, minor, patch),
            None => self.always_latest,
        }
    }

    /// True when the version is strictly below `major.minor.patch`.
    /// Always false for "always latest" requests.
    pub fn below(&self, major: u64, minor: u64, patch: u64) -> bool {
        !self.at_least(major, minor, patch)
    }
}

// =============================================================================
// Binary Request
// =============================================================================

/// Everything the locator and downloader need to identify one binary.
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct BinaryRequest {
    /// Requested server version.
    pub version: ServerVersion,
    /// Host (or overridden) OS descriptor.
    pub os: OsInfo,
    /// Requested platform key (`linux`, `darwin`, `win32`).
    pub platform: String,
    /// Canonical architecture (`amd64`, `arm64`, `aarch64`, ...).
    pub arch: String,
    /// Configured download directory, if any.
    pub download_dir: Option<PathBuf>,
    /// Pre-installed binary short-circuiting the whole pipeline.
    pub system_binary: Option<PathBuf>,
    /// Verify the archive against its MD5 sidecar.
    pub check_md5: bool,
}

impl BinaryRequest {
    /// Resolves a request from configuration and the probed host.
    pub fn resolve(config: &ConfigResolver) -> Result<Self> {
        let version_raw = config
            .resolve(ConfigKey::Version)
            .unwrap_or_else(|| crate::constants::DEFAULT_VERSION.to_string());
        let version = ServerVersion::parse(&version_raw)?;

        let platform = config
            .resolve(ConfigKey::Platform)
            .unwrap_or_else(|| platform::host_os().to_string());

        let raw_arch = config
            .resolve(ConfigKey::Arch)
            .unwrap_or_else(|| platform::host_arch().to_string());
        let arch = translate_arch(&raw_arch, &platform)?;

        let mut os = if platform == "linux" {
            platform::probe().clone()
        } else {
            OsInfo::bare(&platform)
        };
        if let Some(distro) = config.resolve(ConfigKey::Distro) {
            os.distro = Some(distro.to_lowercase());
            os.id_like.clear();
        }

        Ok(Self {
            version,
            os,
            platform,
            arch,
            download_dir: config.resolve_path(ConfigKey::DownloadDir),
            system_binary: config.resolve_path(ConfigKey::SystemBinary),
            check_md5: config.resolve_bool(ConfigKey::Md5Check),
        })
    }
}

// =============================================================================
// Platform / Arch Translation
// =============================================================================

/// Translates a platform key into the download-path platform segment.
///
/// `win32` became `windows` upstream with 4.3.0; older versions keep the
/// historical segment.
pub fn translate_platform(platform: &str, version: &ServerVersion) -> Result<String> {
    match platform {
        "darwin" => Ok("darwin".to_string()),
        "win32" | "windows" => {
            if version.at_least(4, 3, 0) {
                Ok("windows".to_string())
            } else {
                Ok("win32".to_string())
            }
        }
        "linux" | "elementary OS" => Ok("linux".to_string()),
        other => Err(Error::UnknownPlatform(other.to_string())),
    }
}

/// Translates an architecture spelling into its canonical download form.
pub fn translate_arch(arch: &str, platform: &str) -> Result<String> {
    match arch {
        "x64" | "amd64" | "x86_64" => Ok("amd64".to_string()),
        "arm64" => Ok("arm64".to_string()),
        "aarch64" => Ok("aarch64".to_string()),
        "ia32" | "i686" | "i386" => match platform {
            "linux" => Ok("i686".to_string()),
            "win32" | "windows" => Ok("i386".to_string()),
            _ => Err(Error::UnknownArchitecture {
                arch: arch.to_string(),
                platform: platform.to_string(),
            }),
        },
        other => Err(Error::UnknownArchitecture {
            arch: other.to_string(),
            platform: platform.to_string(),
        }),
    }
}

fn is_arm(arch: &str) -> bool {
    matches!(arch, "arm64" | "aarch64")
}

// =============================================================================
// Distro Families
// =============================================================================

type FamilyFn = fn(&OsInfo, &str, &ServerVersion) -> Result<String>;

/// Distro-family dispatch table: the first predicate matching the probed
/// distro (or any `id_like` entry) selects the mapping.
struct DistroFamily {
    predicate: &'static str,
    resolve: FamilyFn,
}

static DISTRO_FAMILIES: &[DistroFamily] = &[
    DistroFamily { predicate: r"\bubuntu\b", resolve: ubuntu_string },
    DistroFamily { predicate: r"\bamzn\b", resolve: amazon_string },
    DistroFamily { predicate: r"\bsuse\b", resolve: suse_string },
    DistroFamily { predicate: r"\b(rhel|centos|scientific|ol)\b", resolve: rhel_string },
    DistroFamily { predicate: r"\bfedora\b", resolve: fedora_string },
    DistroFamily { predicate: r"\bdebian\b", resolve: debian_string },
    DistroFamily { predicate: r"\balpine\b", resolve: alpine_string },
    DistroFamily { predicate: r"\b(arch|archlinux|manjaro|arco\w*)\b", resolve: arch_string },
    DistroFamily { predicate: r"\bgentoo\b", resolve: gentoo_string },
];

fn family_regexes() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        DISTRO_FAMILIES
            .iter()
            .map(|f| Regex::new(f.predicate).unwrap())
            .collect()
    })
}

/// Resolves the distro segment of a Linux archive/binary name, applying
/// the family fallback order. Unknown distros resolve to the legacy
/// empty string with a warning.
pub fn linux_distro_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let regexes = family_regexes();
    let distro = os.distro_or_unknown();

    if distro == "unknown" {
        warn!("distro is unknown; using the generic linux binary");
        return Ok(String::new());
    }

    let candidates = std::iter::once(distro).chain(os.id_like.iter().map(String::as_str));
    for candidate in candidates {
        for (family, re) in DISTRO_FAMILIES.iter().zip(regexes) {
            if re.is_match(candidate) {
                return (family.resolve)(os, arch, version);
            }
        }
    }

    warn!(distro = distro, "unrecognized distro; using the generic linux binary");
    Ok(String::new())
}

fn release_major(os: &OsInfo) -> Option<u64> {
    os.release_str().split('.').next()?.parse().ok()
}

fn release_major_minor(os: &OsInfo) -> (u64, u64) {
    let mut parts = os.release_str().split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Ubuntu mapping.
///
/// | condition                      | correction       |
/// |--------------------------------|------------------|
/// | release unparseable            | treat as 22.04   |
/// | arm64/aarch64, server < 4.1.10 | ubuntu1604       |
/// | server < 4.0.0                 | cap year at 18   |
/// | odd year (non-LTS)             | previous LTS     |
/// | year ≥ 22, server < 6.0.4      | ubuntu2004       |
/// | year < 14                      | ubuntu1404       |
fn ubuntu_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let mut year = release_major(os).unwrap_or(22);

    if is_arm(arch) && version.below(4, 1, 10) {
        return Ok("ubuntu1604".to_string());
    }
    if version.below(4, 0, 0) && year > 18 {
        year = 18;
    }
    if year % 2 == 1 {
        year -= 1;
    }
    if year >= 22 && version.below(6, 0, 4) {
        year = 20;
    }
    if year < 14 {
        year = 14;
    }

    Ok(format!("ubuntu{year}04"))
}

/// Amazon Linux mapping.
///
/// | release | binary      | floor               |
/// |---------|-------------|---------------------|
/// | 2023    | amazon2023  | server ≥ 6.0.5      |
/// | 2       | amazon2     | -                   |
/// | 1 / ?   | amazon      | -                   |
fn amazon_string(os: &OsInfo, _arch: &str, version: &ServerVersion) -> Result<String> {
    match release_major(os) {
        Some(2023) => {
            if version.at_least(6, 0, 5) {
                Ok("amazon2023".to_string())
            } else {
                Ok("amazon2".to_string())
            }
        }
        Some(2) => Ok("amazon2".to_string()),
        _ => Ok("amazon".to_string()),
    }
}

/// SUSE mapping.
///
/// | release | binary | floor          |
/// |---------|--------|----------------|
/// | ≥ 15    | suse15 | server ≥ 4.2.1 |
/// | 12–14   | suse12 | -              |
/// | < 12    | suse11 | -              |
fn suse_string(os: &OsInfo, _arch: &str, version: &ServerVersion) -> Result<String> {
    match release_major(os) {
        Some(r) if r >= 15 => {
            if version.at_least(4, 2, 1) {
                Ok("suse15".to_string())
            } else {
                Ok("suse12".to_string())
            }
        }
        Some(r) if r >= 12 => Ok("suse12".to_string()),
        _ => Ok("suse11".to_string()),
    }
}

/// RHEL-family mapping (also centos, scientific, ol).
///
/// | release | binary | floor          |
/// |---------|--------|----------------|
/// | ≥ 9     | rhel90 | server ≥ 6.0.4 |
/// | ≥ 8     | rhel80 | -              |
/// | ≥ 7     | rhel70 | -              |
/// | ≥ 6     | rhel62 | -              |
///
/// ARM64 builds exist only from RHEL 8.2 and server 4.4.2; anything
/// below either bound has no published artifact.
fn rhel_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let (major, minor) = release_major_minor(os);

    if is_arm(arch) {
        let release_ok = major > 8 || (major == 8 && minor >= 2);
        if !version.is_always_latest() && (!release_ok || version.below(4, 4, 2)) {
            return Err(Error::KnownVersionIncompatibility {
                details: format!(
                    "ARM64 RHEL requires release >= 8.2 and server >= 4.4.2 (got release {}, server {})",
                    os.release_str(),
                    version.raw()
                ),
            });
        }
        if major >= 9 && version.at_least(6, 0, 4) {
            return Ok("rhel90".to_string());
        }
        return Ok("rhel82".to_string());
    }

    let name = match major {
        r if r >= 9 => {
            if version.at_least(6, 0, 4) {
                "rhel90"
            } else {
                "rhel80"
            }
        }
        8 => "rhel80",
        7 => "rhel70",
        6 => "rhel62",
        _ => {
            warn!(release = os.release_str(), "unparseable RHEL release; assuming 7");
            "rhel70"
        }
    };
    Ok(name.to_string())
}

/// Fedora mapping, expressed as the closest RHEL binary.
///
/// | fedora  | rhel equivalent |
/// |---------|-----------------|
/// | ≥ 36    | 9.0             |
/// | 28–35   | 8.0             |
/// | 19–27   | 7.0             |
/// | < 19    | 6.2             |
fn fedora_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let fedora = release_major(os).unwrap_or(36);
    let rhel_release = match fedora {
        f if f >= 36 => "9.0",
        f if f >= 28 => "8.0",
        f if f >= 19 => "7.0",
        _ => "6.2",
    };
    let as_rhel = OsInfo {
        release: Some(rhel_release.to_string()),
        ..os.clone()
    };
    rhel_string(&as_rhel, arch, version)
}

/// Debian mapping.
///
/// | release | binary   | floor          |
/// |---------|----------|----------------|
/// | ≥ 12    | debian12 | server ≥ 6.0.8 |
/// | 11      | debian11 | server ≥ 5.0.8 |
/// | 10      | debian10 | server ≥ 4.2.1 |
/// | 9       | debian92 | -              |
/// | ≤ 8     | debian81 | -              |
///
/// Unstable/testing (no numeric release) maps to the newest entry.
fn debian_string(os: &OsInfo, _arch: &str, version: &ServerVersion) -> Result<String> {
    let major = release_major(os).unwrap_or_else(|| {
        // sid and testing report no VERSION_ID
        match os.codename.as_deref() {
            Some("sid") | Some("trixie") | Some("unstable") | Some("testing") => 12,
            _ => 11,
        }
    });

    let name = if major >= 12 {
        if version.at_least(6, 0, 8) {
            "debian12"
        } else {
            "debian11"
        }
    } else if major >= 11 {
        if version.at_least(5, 0, 8) {
            "debian11"
        } else {
            "debian10"
        }
    } else if major >= 10 {
        if version.at_least(4, 2, 1) {
            "debian10"
        } else {
            "debian92"
        }
    } else if major >= 9 {
        "debian92"
    } else {
        "debian81"
    };
    Ok(name.to_string())
}

/// Alpine has no published binaries; the generic linux build may or may
/// not run under musl.
fn alpine_string(_os: &OsInfo, _arch: &str, _version: &ServerVersion) -> Result<String> {
    warn!("Alpine is not supported upstream; using the generic linux binary");
    Ok(String::new())
}

/// Arch-family distros have no upstream builds; the Ubuntu 22.04 binary
/// is the conventional stand-in.
fn arch_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let as_ubuntu = OsInfo {
        release: Some("22.04".to_string()),
        ..os.clone()
    };
    ubuntu_string(&as_ubuntu, arch, version)
}

/// Gentoo has no upstream builds; the Debian 11 binary is the
/// conventional stand-in.
fn gentoo_string(os: &OsInfo, arch: &str, version: &ServerVersion) -> Result<String> {
    let as_debian = OsInfo {
        release: Some("11".to_string()),
        ..os.clone()
    };
    debian_string(&as_debian, arch, version)
}

// =============================================================================
// Names & URL
// =============================================================================

/// Derives the archive file name for a request, per platform branch.
pub fn archive_name(req: &BinaryRequest) -> Result<String> {
    let platform = translate_platform(&req.platform, &req.version)?;
    let version = req.version.raw();
    let arch = &req.arch;

    let name = match platform.as_str() {
        "win32" | "windows" => format!("mongodb-{platform}-{arch}-{version}.zip"),
        "darwin" => format!("mongodb-macos-{arch}-{version}.tgz"),
        "linux" => {
            let distro = linux_distro_string(&req.os, arch, &req.version)?;
            if distro.is_empty() {
                format!("mongodb-linux-{arch}-{version}.tgz")
            } else {
                format!("mongodb-linux-{arch}-{distro}-{version}.tgz")
            }
        }
        other => return Err(Error::UnknownPlatform(other.to_string())),
    };
    Ok(name)
}

/// Back-compat archive-name pattern. Still recognizes `osx`/`macos`
/// stems so user-supplied `ARCHIVE_NAME` values from older setups parse.
fn archive_stem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<stem>mongodb-(?:linux|win32|windows|osx|macos)-(?P<rest>.+?))\.(?:tgz|tar\.gz|zip)$",
        )
        .unwrap()
    })
}

/// Extracts the stem (name minus extension) from an archive name.
pub fn parse_archive_stem(name: &str) -> Result<String> {
    let caps = archive_stem_re()
        .captures(name)
        .ok_or_else(|| Error::ArchiveNameParse {
            name: name.to_string(),
            group: "stem",
        })?;
    let stem = caps.name("stem").ok_or_else(|| Error::ArchiveNameParse {
        name: name.to_string(),
        group: "stem",
    })?;
    Ok(stem.as_str().to_string())
}

/// Derives the canonical on-disk binary name.
///
/// Default form: `mongod-<arch>-<distro-or-os>-<version>[.exe]`. With
/// archive naming in force, the archive's stem instead.
pub fn binary_name(config: &ConfigResolver, req: &BinaryRequest) -> Result<String> {
    let explicit_archive = config.resolve(ConfigKey::ArchiveName);
    let use_archive_name =
        explicit_archive.is_some() || config.resolve_bool(ConfigKey::UseArchiveNameForBinaryName);

    if use_archive_name {
        let archive = match explicit_archive {
            Some(name) => name,
            None => archive_name(req)?,
        };
        return parse_archive_stem(&archive);
    }

    let platform = translate_platform(&req.platform, &req.version)?;
    let segment = match platform.as_str() {
        "linux" => {
            let distro = linux_distro_string(&req.os, &req.arch, &req.version)?;
            if distro.is_empty() {
                "linux".to_string()
            } else {
                distro
            }
        }
        other => other.to_string(),
    };

    let ext = if matches!(platform.as_str(), "win32" | "windows") {
        ".exe"
    } else {
        ""
    };
    Ok(format!(
        "mongod-{}-{}-{}{}",
        req.arch,
        segment,
        req.version.raw(),
        ext
    ))
}

/// Computes the archive download URL for a request.
pub fn archive_url(config: &ConfigResolver, req: &BinaryRequest) -> Result<Url> {
    if let Some(explicit) = config.resolve(ConfigKey::DownloadUrl) {
        return Url::parse(&explicit).map_err(|e| Error::DownloadFailed {
            url: explicit,
            reason: format!("invalid DOWNLOAD_URL: {e}"),
        });
    }

    let mirror = config
        .resolve(ConfigKey::DownloadMirror)
        .unwrap_or_else(|| DEFAULT_MIRROR.to_string());
    let platform = translate_platform(&req.platform, &req.version)?;
    let raw = format!(
        "{}/{}-{}/archive/{}",
        mirror.trim_end_matches('/'),
        platform,
        req.arch,
        req.version.raw()
    );

    let mut url = Url::parse(&raw).map_err(|e| Error::DownloadFailed {
        url: raw.clone(),
        reason: format!("invalid download URL: {e}"),
    })?;

    if config.resolve_bool(ConfigKey::UseHttp) && url.scheme() == "https" {
        // Infallible for http(s) URLs.
        let _ = url.set_scheme("http");
    }
    Ok(url)
}
