//! # Cross-Process Download Lock
//!
//! Advisory lock built on a marker file whose presence is the lock and
//! whose content identifies the owner:
//!
//! ```text
//! <pid> <uuid>
//! ```
//!
//! The pid distinguishes processes; the uuid distinguishes acquisitions
//! within one process. A marker owned by a pid that is no longer alive
//! is stale and reclaimable.
//!
//! ## Coordination Model
//!
//! - **In-process**: a [`LockRegistry`] (explicit collaborator, never a
//!   hidden global) serializes marker writes under a process-wide mutex
//!   and wakes same-process waiters through per-path
//!   [`tokio::sync::Notify`] handles. The mutex is deliberately held
//!   across the marker-file write and unlink; both are short local I/O.
//! - **Cross-process**: waiters additionally re-check the marker every
//!   3 seconds, which is how a dead holder in another process is
//!   reclaimed.
//!
//! Acquisition retries forever by design; callers impose deadlines
//! externally if they need one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::constants::LOCK_POLL_INTERVAL;
use crate::error::{Error, Result};

// =============================================================================
// Liveness
// =============================================================================

/// Probes a pid with the no-op signal; any error counts as not-alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Non-unix targets have no cheap liveness probe; report alive so a
/// foreign holder is never reclaimed by mistake.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide lock bookkeeping: the set of paths held by this process
/// and the per-path waiter notifications.
#[derive(Debug, Default)]
pub struct LockRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    held: HashSet<PathBuf>,
    waiters: HashMap<PathBuf, Arc<Notify>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn waiter(&self, path: &Path) -> Arc<Notify> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .waiters
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Whether this process currently holds the lock at `path`.
    pub fn holds(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.held.contains(path)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Outcome of a marker-file inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Marker absent, unreadable, or owned by a dead pid.
    Available,
    /// Owned by this pid with the supplied uuid (unlock validation).
    AvailableInstance,
    /// Owned by this pid under a different acquisition.
    LockedSelf,
    /// Owned by a different, live pid.
    LockedDifferent,
}

/// Inspects the marker at `path`. `uuid` is supplied during unlock to
/// distinguish our own acquisition from same-process contention.
pub fn check(path: &Path, uuid: Option<Uuid>) -> LockStatus {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return LockStatus::Available,
    };

    let mut parts = contents.split_whitespace();
    let (Some(pid_str), Some(uuid_str)) = (parts.next(), parts.next()) else {
        trace!(path = %path.display(), "malformed lockfile treated as available");
        return LockStatus::Available;
    };
    let (Ok(pid), Ok(owner)) = (pid_str.parse::<u32>(), Uuid::parse_str(uuid_str)) else {
        trace!(path = %path.display(), "malformed lockfile treated as available");
        return LockStatus::Available;
    };

    if pid == std::process::id() {
        if uuid == Some(owner) {
            LockStatus::AvailableInstance
        } else {
            LockStatus::LockedSelf
        }
    } else if pid_alive(pid) {
        LockStatus::LockedDifferent
    } else {
        debug!(path = %path.display(), pid = pid, "reclaiming lock from dead process");
        LockStatus::Available
    }
}

// =============================================================================
// Handle
// =============================================================================

/// An acquired lock. Call [`LockHandle::unlock`] when done; a second
/// unlock on the same handle is a no-op.
#[derive(Debug)]
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    path: PathBuf,
    uuid: Uuid,
    active: bool,
}

impl LockHandle {
    /// The marker-file path this handle owns.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock: validates ownership, unlinks the marker, and
    /// wakes in-process waiters.
    pub async fn unlock(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        {
            let mut inner = self
                .registry
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            match check(&self.path, Some(self.uuid)) {
                LockStatus::AvailableInstance => {
                    std::fs::remove_file(&self.path)?;
                }
                LockStatus::Available => {
                    // Someone already cleaned the marker up; just drop
                    // our bookkeeping.
                    warn!(path = %self.path.display(), "lockfile already removed before unlock");
                }
                LockStatus::LockedSelf => {
                    return Err(Error::UnableToUnlock {
                        path: self.path.clone(),
                        holder: "this instance",
                    });
                }
                LockStatus::LockedDifferent => {
                    return Err(Error::UnableToUnlock {
                        path: self.path.clone(),
                        holder: "another process",
                    });
                }
            }

            inner.held.remove(&self.path);
            if let Some(waiter) = inner.waiters.get(&self.path) {
                waiter.notify_waiters();
            }
        }

        debug!(path = %self.path.display(), "unlocked");
        self.active = false;
        Ok(())
    }
}

// =============================================================================
// Acquisition
// =============================================================================

fn normalize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Acquires the lock at `path`, waiting as long as it takes.
///
/// Same-process waiters are woken by the holder's unlock; cross-process
/// contention is resolved by the 3-second re-check, which also reclaims
/// markers whose owning process died.
pub async fn lock(registry: &Arc<LockRegistry>, path: &Path) -> Result<LockHandle> {
    let path = normalize(path);

    loop {
        match check(&path, None) {
            LockStatus::Available => {
                if let Some(handle) = try_create(registry, &path)? {
                    return Ok(handle);
                }
                // Race lost against another task in this process.
                wait_for_unlock(registry, &path).await;
            }
            LockStatus::LockedSelf | LockStatus::LockedDifferent => {
                trace!(path = %path.display(), "lock busy; waiting");
                wait_for_unlock(registry, &path).await;
            }
            LockStatus::AvailableInstance => {
                // check() without a uuid never reports this.
                return Err(Error::UnknownLockfileStatus {
                    path,
                    status: "availableInstance".to_string(),
                });
            }
        }
    }
}

/// Creates the marker under the registry mutex. Returns `None` when the
/// path is already held in-process (the caller waits and retries).
fn try_create(registry: &Arc<LockRegistry>, path: &Path) -> Result<Option<LockHandle>> {
    let mut inner = registry.inner.lock().unwrap_or_else(|e| e.into_inner());

    if inner.held.contains(path) {
        return Ok(None);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let uuid = Uuid::new_v4();
    std::fs::write(path, format!("{} {}", std::process::id(), uuid))?;
    inner.held.insert(path.to_path_buf());

    debug!(path = %path.display(), %uuid, "locked");
    Ok(Some(LockHandle {
        registry: Arc::clone(registry),
        path: path.to_path_buf(),
        uuid,
        active: true,
    }))
}

/// Waits for either an in-process unlock of `path` or the poll interval,
/// whichever fires first.
async fn wait_for_unlock(registry: &Arc<LockRegistry>, path: &Path) {
    let notify = registry.waiter(path);
    let notified = notify.notified();
    tokio::select! {
        _ = notified => {}
        _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
    }
}
