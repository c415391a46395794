//! Error types for the provisioning and supervision layer.

use std::path::PathBuf;

use crate::instance::InstanceState;

/// Result type alias for provisioning and supervision operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning or supervising an instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // State Errors
    // =========================================================================
    /// Operation invoked in a state that disallows it.
    #[error("incorrect state for operation '{operation}': allowed {allowed:?}, actual {actual}")]
    IncorrectState {
        operation: &'static str,
        allowed: &'static [InstanceState],
        actual: InstanceState,
    },

    // =========================================================================
    // Lockfile Errors
    // =========================================================================
    /// The lockfile check produced a status the caller cannot act on.
    #[error("unknown lockfile status '{status}' for {path}")]
    UnknownLockfileStatus { path: PathBuf, status: String },

    /// Unlock attempted on a lock this handle does not own.
    #[error("unable to unlock {path}: held by {holder}")]
    UnableToUnlock {
        path: PathBuf,
        /// `"this instance"` for same-process contention, `"another process"` otherwise.
        holder: &'static str,
    },

    // =========================================================================
    // Platform / Arch Errors
    // =========================================================================
    /// Platform string has no download mapping.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// Architecture is unknown or unsupported on this platform.
    #[error("unsupported architecture '{arch}' for platform '{platform}'")]
    UnknownArchitecture { arch: String, platform: String },

    // =========================================================================
    // Version Errors
    // =========================================================================
    /// Version string cannot be coerced to semver.
    #[error("unable to coerce version string '{0}'")]
    UncoercibleVersion(String),

    /// The distro/arch/version combination is known not to exist upstream.
    #[error("no binary release exists for this combination: {details}")]
    KnownVersionIncompatibility { details: String },

    // =========================================================================
    // Archive Name Errors
    // =========================================================================
    /// The archive name did not match the expected pattern.
    #[error("archive name '{name}' did not yield capture group '{group}'")]
    ArchiveNameParse { name: String, group: &'static str },

    // =========================================================================
    // Filesystem Errors
    // =========================================================================
    /// No server binary at the resolved path and runtime download is off.
    #[error("no server binary found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// Binary exists but cannot be executed.
    #[error("insufficient permissions to execute {path}")]
    InsufficientPermissions { path: PathBuf },

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Download failed with an HTTP status or transport error.
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Archive MD5 did not match the published sidecar.
    #[error("MD5 check failed for {archive}: expected {expected}, computed {actual}")]
    Md5CheckFailed {
        archive: PathBuf,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// The spawned process produced no pid.
    #[error("failed to start binary {binary}: {reason}")]
    StartBinaryFailed { binary: PathBuf, reason: String },

    /// The server exited before or after readiness with a failure code.
    #[error("instance closed unexpectedly (code {code:?}, signal {signal:?}){hint}")]
    UnexpectedClose {
        code: Option<i32>,
        signal: Option<i32>,
        hint: String,
    },

    /// A fatal condition parsed from the server's own output.
    #[error("instance error: {0}")]
    StdoutInstanceError(String),

    /// The launch timeout elapsed before the readiness line appeared.
    #[error("instance failed to become ready within {0:?}")]
    LaunchTimeout(std::time::Duration),

    // =========================================================================
    // Bookkeeping Errors
    // =========================================================================
    /// Instance info requested before `start` populated it.
    #[error("instance info is not available in state {state} (during '{operation}')")]
    InstanceInfoMissing {
        operation: &'static str,
        state: InstanceState,
    },

    /// `ensure_instance` observed a transition to a non-running state.
    #[error("ensure_instance failed: instance transitioned to {actual} instead of running")]
    EnsureInstance { actual: InstanceState },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
