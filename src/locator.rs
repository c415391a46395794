//! Cached-binary location.
//!
//! A pure path planner: enumerates the candidate locations for a server
//! binary and reports the first that exists, or the preferred location a
//! download should install into. Never writes to the filesystem.
//!
//! Candidate order:
//!
//! 1. `<DOWNLOAD_DIR>/<binary_name>` when configured
//! 2. `<home>/.cache/minio-binaries/<binary_name>` (global cache)
//! 3. `<project>/.cache/minio-binaries/<binary_name>` (project cache)
//! 4. `<cwd>/minio-binaries/<binary_name>`
//!
//! A configured `SYSTEM_BINARY` that exists short-circuits the search.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifact::{self, BinaryRequest};
use crate::config::{ConfigKey, ConfigResolver};
use crate::constants::BINARY_CACHE_DIR;
use crate::error::Result;

/// Outcome of a locate pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A binary exists at this path.
    Existing(PathBuf),
    /// Nothing cached; a download should install here.
    Preferred(PathBuf),
}

impl Location {
    /// The path, whether found or merely preferred.
    pub fn path(&self) -> &Path {
        match self {
            Location::Existing(p) | Location::Preferred(p) => p,
        }
    }

    /// Whether a binary already exists.
    pub fn exists(&self) -> bool {
        matches!(self, Location::Existing(_))
    }
}

/// The candidate paths for one request, in search order.
#[derive(Debug, Clone)]
pub struct Candidates {
    /// `<DOWNLOAD_DIR>/<binary_name>`, when configured.
    pub config_path: Option<PathBuf>,
    /// Global home cache.
    pub legacy_home: Option<PathBuf>,
    /// Project-local cache.
    pub modules_cache: Option<PathBuf>,
    /// CWD-relative fallback.
    pub relative: Option<PathBuf>,
}

impl Candidates {
    fn in_order(&self) -> impl Iterator<Item = &PathBuf> {
        self.config_path
            .iter()
            .chain(self.legacy_home.iter())
            .chain(self.modules_cache.iter())
            .chain(self.relative.iter())
    }
}

/// Strips trailing `node_modules` / `minio-test-server*` segments so a
/// working directory inside an embedded install still resolves to the
/// host project's cache.
fn project_root(cwd: &Path) -> PathBuf {
    let mut root = cwd.to_path_buf();
    loop {
        let strip = root
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == "node_modules" || n.starts_with("minio-test-server"));
        if !strip || !root.pop() {
            break;
        }
    }
    root
}

/// Computes the candidates for a request against explicit roots.
pub fn candidates_at(
    config: &ConfigResolver,
    req: &BinaryRequest,
    cwd: &Path,
    home: Option<&Path>,
) -> Result<Candidates> {
    let name = artifact::binary_name(config, req)?;

    Ok(Candidates {
        config_path: req.download_dir.as_ref().map(|d| d.join(&name)),
        legacy_home: home.map(|h| h.join(".cache").join(BINARY_CACHE_DIR).join(&name)),
        modules_cache: Some(
            project_root(cwd)
                .join(".cache")
                .join(BINARY_CACHE_DIR)
                .join(&name),
        ),
        relative: Some(cwd.join(BINARY_CACHE_DIR).join(&name)),
    })
}

/// Locates a binary against explicit roots. See [`locate`].
pub fn locate_at(
    config: &ConfigResolver,
    req: &BinaryRequest,
    cwd: &Path,
    home: Option<&Path>,
) -> Result<Location> {
    if let Some(system) = &req.system_binary {
        if system.exists() {
            debug!(binary = %system.display(), "using system binary");
            return Ok(Location::Existing(system.clone()));
        }
        debug!(
            binary = %system.display(),
            "configured system binary does not exist; falling back to cache search"
        );
    }

    let candidates = candidates_at(config, req, cwd, home)?;
    for candidate in candidates.in_order() {
        if candidate.exists() {
            debug!(binary = %candidate.display(), "found cached binary");
            return Ok(Location::Existing(candidate.clone()));
        }
    }

    let preferred = candidates
        .config_path
        .clone()
        .or_else(|| {
            if config.resolve_bool(ConfigKey::PreferGlobalPath) {
                candidates.legacy_home.clone()
            } else {
                None
            }
        })
        .or_else(|| candidates.modules_cache.clone())
        .or_else(|| candidates.relative.clone())
        .unwrap_or_else(|| PathBuf::from(BINARY_CACHE_DIR));

    debug!(preferred = %preferred.display(), "no cached binary; download target chosen");
    Ok(Location::Preferred(preferred))
}

/// Locates a binary for a request: the first existing candidate, or the
/// preferred download target when nothing is cached.
pub fn locate(config: &ConfigResolver, req: &BinaryRequest) -> Result<Location> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let home = dirs::home_dir();
    locate_at(config, req, &cwd, home.as_deref())
}
