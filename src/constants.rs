//! Constants for the provisioning and supervision layer.
//!
//! All limits, timeouts, prefixes and defaults are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Versions & Download Sources
// =============================================================================

/// Server version provisioned when the caller pins nothing.
pub const DEFAULT_VERSION: &str = "7.0.14";

/// Official release index queried when no mirror is configured.
pub const DEFAULT_MIRROR: &str = "https://dl.min.io/server/minio/release";

/// Redirect cap applied when `MAX_REDIRECTS` is not configured.
pub const DEFAULT_MAX_REDIRECTS: usize = 2;

// =============================================================================
// Environment & Manifest
// =============================================================================

/// Prefix every recognized environment variable carries.
pub const ENV_PREFIX: &str = "MINIOTST_";

/// Manifest file consulted during the upward project walk.
pub const MANIFEST_FILE: &str = "Cargo.toml";

/// Table under `[package.metadata]` holding project-level configuration.
pub const MANIFEST_METADATA_KEY: &str = "minio-test-server";

// =============================================================================
// Cache Layout
// =============================================================================

/// Subdirectory of the user cache root holding downloaded binaries.
pub const BINARY_CACHE_DIR: &str = "minio-binaries";

/// Prefix of temp data directories created for instances.
pub const TMP_DATA_DIR_PREFIX: &str = "minio-tst-";

/// Suffix of the in-flight download file next to the final archive.
pub const DOWNLOADING_SUFFIX: &str = "downloading";

/// Suffix of per-version lockfiles inside the download directory.
pub const LOCKFILE_SUFFIX: &str = "lock";

// =============================================================================
// Timeouts & Intervals
// =============================================================================

/// Wall-clock bound on a single HTTP download request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Cross-process lockfile re-check interval while waiting.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Launch timeout applied when the caller supplies none.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest launch timeout honored; shorter requests are clamped up.
pub const MIN_LAUNCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace period after SIGINT before escalating to SIGKILL.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Minimum spacing between download progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Process Interface
// =============================================================================

/// Subcommand passed to the server binary ahead of the data path.
pub const SERVER_SUBCOMMAND: &str = "server";

/// File mode applied to the installed binary.
pub const BINARY_MODE: u32 = 0o775;

/// Exit code Windows builds emit for SIGINT-like termination; accepted
/// as clean alongside 0.
pub const WINDOWS_SIGINT_EXIT_CODE: i32 = 12;

/// Windows exit codes above this get the missing-runtime install hint.
pub const WINDOWS_RUNTIME_HINT_THRESHOLD: i64 = 1_000_000_000;

// =============================================================================
// Event Plumbing
// =============================================================================

/// Capacity of the instance event broadcast channel. Observers that lag
/// further than this lose the oldest events, never the newest.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
