//! # Archive Download & Binary Install
//!
//! Provisions a server binary: resolves the archive URL, downloads it
//! under a cross-process lockfile, verifies the published MD5 sidecar,
//! extracts `bin/minio` from the archive, and installs it atomically at
//! the locator's preferred path.
//!
//! ## Coordination
//!
//! N concurrent provisions of the same version perform exactly one
//! download: the per-version lockfile at `<download_dir>/<version>.lock`
//! serializes processes, and the per-version [`BinaryCache`] (re-checked
//! inside the lock) short-circuits same-process callers. The cache is
//! written only after both download and extraction succeed.
//!
//! ## Transfer Discipline
//!
//! - Streamed to `<archive>.downloading`, then atomically renamed.
//! - `Content-Length` is required; short reads are rejected (except for
//!   `.md5` sidecars, which some mirrors serve without a length).
//! - HTTP 403 means the version/platform combination does not exist
//!   upstream and is reported as such; any other non-200 carries its
//!   status code.
//! - Redirects are capped by `MAX_REDIRECTS`; proxies come from the
//!   conventional npm/yarn/https_proxy environment chain; TLS
//!   verification honors `npm_config_strict_ssl`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::{self, BinaryRequest};
use crate::config::{parse_bool, ConfigResolver};
use crate::constants::{
    DOWNLOADING_SUFFIX, HTTP_TIMEOUT, LOCKFILE_SUFFIX, PROGRESS_INTERVAL,
};
use crate::error::{Error, Result};
use crate::lockfile::{self, LockRegistry};
use crate::locator::{self, Location};

/// Proxy sources consulted in order; the first non-empty wins.
const PROXY_ENV_CHAIN: &[&str] = &[
    "yarn_https-proxy",
    "yarn_proxy",
    "npm_config_https-proxy",
    "npm_config_proxy",
    "https_proxy",
    "http_proxy",
    "HTTPS_PROXY",
    "HTTP_PROXY",
];

// =============================================================================
// Binary Cache
// =============================================================================

/// Process-local `version → binary path` map, populated only after a
/// successful provision. An explicit collaborator shared between
/// downloaders rather than a hidden global.
#[derive(Debug, Default)]
pub struct BinaryCache {
    inner: Mutex<HashMap<String, PathBuf>>,
}

impl BinaryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The cached binary path for a version, if provisioned before.
    pub fn get(&self, version: &str) -> Option<PathBuf> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(version).cloned()
    }

    fn insert(&self, version: &str, path: PathBuf) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(version.to_string(), path);
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Throttled transfer reporting: at most one line per interval, plus a
/// forced final update.
struct Progress {
    url: String,
    total: u64,
    downloaded: u64,
    last_report: Option<Instant>,
}

impl Progress {
    fn new(url: &Url, total: u64) -> Self {
        Self {
            url: url.to_string(),
            total,
            downloaded: 0,
            last_report: None,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.downloaded += bytes;
        let due = self
            .last_report
            .map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL);
        if due {
            self.report();
        }
    }

    fn finish(&mut self) {
        self.report();
    }

    fn report(&mut self) {
        let percent = if self.total > 0 {
            (self.downloaded * 100 / self.total).min(100)
        } else {
            0
        };
        info!(
            url = %self.url,
            downloaded = self.downloaded,
            total = self.total,
            percent = percent,
            "downloading"
        );
        self.last_report = Some(Instant::now());
    }
}

// =============================================================================
// Downloader
// =============================================================================

/// Downloads and installs server binaries under lockfile coordination.
pub struct Downloader {
    config: ConfigResolver,
    cache: Arc<BinaryCache>,
    locks: Arc<LockRegistry>,
}

impl Downloader {
    pub fn new(config: ConfigResolver, cache: Arc<BinaryCache>, locks: Arc<LockRegistry>) -> Self {
        Self {
            config,
            cache,
            locks,
        }
    }

    /// Provisions the binary for a request, returning its absolute path.
    ///
    /// Concurrent calls for the same version (in this process or others
    /// sharing the download directory) result in a single download.
    pub async fn provision(&self, req: &BinaryRequest) -> Result<PathBuf> {
        let version = req.version.raw().to_string();
        if let Some(cached) = self.cache.get(&version) {
            return Ok(cached);
        }

        let location = locator::locate(&self.config, req)?;
        let binary_path = match &location {
            Location::Existing(path) => {
                self.cache.insert(&version, path.clone());
                return Ok(path.clone());
            }
            Location::Preferred(path) => path.clone(),
        };

        let download_dir = binary_path
            .parent()
            .ok_or_else(|| Error::BinaryNotFound {
                path: binary_path.clone(),
            })?
            .to_path_buf();
        tokio::fs::create_dir_all(&download_dir).await?;
        ensure_dir_usable(&download_dir)?;

        let lock_path = download_dir.join(format!("{version}.{LOCKFILE_SUFFIX}"));
        let mut lock = lockfile::lock(&self.locks, &lock_path).await?;

        // Re-check both caches now that we hold the lock: another caller
        // (or another process) may have finished while we waited.
        let result = match self.cache.get(&version) {
            Some(cached) => Ok(cached),
            None if binary_path.exists() => Ok(binary_path.clone()),
            None => {
                self.download_and_extract(req, &download_dir, &binary_path)
                    .await
                    .map(|()| binary_path.clone())
            }
        };

        lock.unlock().await?;

        let path = result?;
        self.cache.insert(&version, path.clone());
        Ok(path)
    }

    async fn download_and_extract(
        &self,
        req: &BinaryRequest,
        download_dir: &Path,
        binary_path: &Path,
    ) -> Result<()> {
        let url = artifact::archive_url(&self.config, req)?;
        let archive_path = download_dir.join(artifact::archive_name(req)?);

        self.download_file(&url, &archive_path).await?;

        if req.check_md5 {
            self.verify_md5(&url, &archive_path).await?;
        }

        extract_binary(&archive_path, binary_path).await?;

        tokio::fs::remove_file(&archive_path).await?;
        info!(binary = %binary_path.display(), "binary installed");
        Ok(())
    }

    /// Streams a URL to `dest` through `<dest>.downloading`, renaming on
    /// completion.
    async fn download_file(&self, url: &Url, dest: &Path) -> Result<()> {
        let client = self.build_client()?;
        debug!(url = %url, dest = %dest.display(), "starting download");

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 403 {
            return Err(Error::DownloadFailed {
                url: url.to_string(),
                reason: "status 403: the requested version is not available for this \
                         platform (no such release exists upstream)"
                    .to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::DownloadFailed {
                url: url.to_string(),
                reason: format!("status {}", status.as_u16()),
            });
        }

        let is_md5 = url.path().ends_with(".md5");
        let total = match response.content_length() {
            Some(len) => len,
            None => {
                return Err(Error::DownloadFailed {
                    url: url.to_string(),
                    reason: "response carries no content-length".to_string(),
                })
            }
        };

        let temp_path = append_extension(dest, DOWNLOADING_SUFFIX);
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut progress = Progress::new(url, total);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::DownloadFailed {
                url: url.to_string(),
                reason: format!("transfer error: {e}"),
            })?;
            file.write_all(&chunk).await?;
            progress.advance(chunk.len() as u64);
        }
        file.flush().await?;
        drop(file);
        progress.finish();

        if progress.downloaded < total && !is_md5 {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Error::DownloadFailed {
                url: url.to_string(),
                reason: format!(
                    "short read: got {} of {} bytes",
                    progress.downloaded, total
                ),
            });
        }

        tokio::fs::rename(&temp_path, dest).await?;
        Ok(())
    }

    /// Fetches `<url>.md5` and compares its leading hex token against
    /// the archive's digest. The archive is removed on mismatch so no
    /// corrupt download survives.
    async fn verify_md5(&self, url: &Url, archive_path: &Path) -> Result<()> {
        let md5_url = Url::parse(&format!("{url}.md5")).map_err(|e| Error::DownloadFailed {
            url: format!("{url}.md5"),
            reason: e.to_string(),
        })?;
        let sidecar_path = append_extension(archive_path, "md5");

        self.download_file(&md5_url, &sidecar_path).await?;

        let sidecar = tokio::fs::read_to_string(&sidecar_path).await?;
        let _ = tokio::fs::remove_file(&sidecar_path).await;
        let expected = sidecar
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();

        let contents = tokio::fs::read(archive_path).await?;
        let actual = hex::encode(Md5::digest(&contents));

        if expected != actual {
            let _ = tokio::fs::remove_file(archive_path).await;
            return Err(Error::Md5CheckFailed {
                archive: archive_path.to_path_buf(),
                expected,
                actual,
            });
        }

        debug!(archive = %archive_path.display(), md5 = %actual, "MD5 verified");
        Ok(())
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(
                self.config.max_redirects(),
            ))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ));

        if let Ok(strict) = std::env::var("npm_config_strict_ssl") {
            if !parse_bool(&strict) {
                warn!("npm_config_strict_ssl is off; skipping TLS verification");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(proxy_url) = PROXY_ENV_CHAIN
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.is_empty())
        {
            debug!(proxy = %proxy_url, "using proxy for download");
            let proxy = reqwest::Proxy::all(&proxy_url).map_err(|e| Error::DownloadFailed {
                url: proxy_url,
                reason: format!("invalid proxy: {e}"),
            })?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(|e| Error::DownloadFailed {
            url: String::new(),
            reason: format!("failed to build HTTP client: {e}"),
        })
    }
}

/// Appends a suffix after the existing extension (`a.tgz` → `a.tgz.md5`).
fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

// =============================================================================
// Extraction
// =============================================================================

/// Archive entries considered the server binary.
fn binary_entry_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bin/(minio|minio\.exe)$").unwrap())
}

/// Extracts the server binary out of an archive into `binary_path`,
/// mode `0o775`. Dispatches on the archive extension.
async fn extract_binary(archive_path: &Path, binary_path: &Path) -> Result<()> {
    let archive = archive_path.to_path_buf();
    let binary = binary_path.to_path_buf();
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    // Archive walking is synchronous; keep it off the runtime threads.
    tokio::task::spawn_blocking(move || {
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            extract_tgz(&archive, &binary)
        } else if name.ends_with(".zip") {
            extract_zip(&archive, &binary)
        } else {
            Err(Error::ArchiveNameParse {
                name,
                group: "extension",
            })
        }
    })
    .await
    .map_err(|e| Error::DownloadFailed {
        url: String::new(),
        reason: format!("extraction task failed: {e}"),
    })?
}

fn extract_tgz(archive_path: &Path, binary_path: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        if binary_entry_re().is_match(&path.to_string_lossy()) {
            let mut out = std::fs::File::create(binary_path)?;
            std::io::copy(&mut entry, &mut out)?;
            set_binary_mode(binary_path)?;
            debug!(binary = %binary_path.display(), "extracted from tar archive");
            return Ok(());
        }
    }

    Err(Error::BinaryNotFound {
        path: archive_path.to_path_buf(),
    })
}

fn extract_zip(archive_path: &Path, binary_path: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::DownloadFailed {
        url: String::new(),
        reason: format!("unreadable zip archive: {e}"),
    })?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| Error::DownloadFailed {
            url: String::new(),
            reason: format!("unreadable zip entry: {e}"),
        })?;
        if binary_entry_re().is_match(entry.name()) {
            let mut out = std::fs::File::create(binary_path)?;
            std::io::copy(&mut entry, &mut out)?;
            set_binary_mode(binary_path)?;
            debug!(binary = %binary_path.display(), "extracted from zip archive");
            return Ok(());
        }
    }

    Err(Error::BinaryNotFound {
        path: archive_path.to_path_buf(),
    })
}

#[cfg(unix)]
fn set_binary_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(crate::constants::BINARY_MODE),
    )?;
    Ok(())
}

#[cfg(not(unix))]
fn set_binary_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// Verifies the download directory is writable and executable.
#[cfg(unix)]
fn ensure_dir_usable(dir: &Path) -> Result<()> {
    use nix::unistd::{access, AccessFlags};
    access(dir, AccessFlags::W_OK | AccessFlags::X_OK).map_err(|_| {
        Error::InsufficientPermissions {
            path: dir.to_path_buf(),
        }
    })
}

#[cfg(not(unix))]
fn ensure_dir_usable(dir: &Path) -> Result<()> {
    let meta = std::fs::metadata(dir)?;
    if meta.permissions().readonly() {
        return Err(Error::InsufficientPermissions {
            path: dir.to_path_buf(),
        });
    }
    Ok(())
}
