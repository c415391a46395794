//! # Instance Supervision
//!
//! Owns the full lifecycle of one server process:
//!
//! ```text
//!   ┌───────┐  start   ┌──────────┐  ready   ┌─────────┐
//!   │  New  │ ───────► │ Starting │ ───────► │ Running │
//!   └───────┘          └────┬─────┘          └────┬────┘
//!       ▲                   │ failure             │ stop / fatal output
//!       │ cleanup           ▼                     ▼
//!       │              ┌─────────┐  stop     ┌─────────┐
//!       └───────────── │ Stopped │ ◄──────── │ (kill)  │
//!                      └─────────┘           └─────────┘
//! ```
//!
//! `start` provisions the binary (locator, then downloader), selects a
//! free port, spawns `<binary> server <data_path> …` with piped stdio,
//! and races readiness against fatal output, early exit, and the launch
//! timeout. Every stdout/stderr line is scanned for the readiness and
//! fatal patterns; fatal lines terminate the child directly (the event
//! broadcast exists for external observers, not for the supervisor's own
//! control flow).
//!
//! ## Orphan-Proofing
//!
//! A detached reaper sidecar polls both this process and the server;
//! when the supervising process dies the reaper SIGINTs the server, so
//! no instance outlives its test run. The reaper is never part of the
//! supervisor's wait set.
//!
//! ## Shutdown
//!
//! Two-phase for both server and reaper: SIGINT, a 10 s grace period,
//! then SIGKILL with another 10 s before giving up. Cleanup removes the
//! temp data directory the supervisor created; caller-supplied data
//! directories survive unless `force` is set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigKey, ConfigResolver};
use crate::constants::{
    DEFAULT_LAUNCH_TIMEOUT, EVENT_CHANNEL_CAPACITY, KILL_GRACE_PERIOD, MIN_LAUNCH_TIMEOUT,
    SERVER_SUBCOMMAND, TMP_DATA_DIR_PREFIX, WINDOWS_RUNTIME_HINT_THRESHOLD,
    WINDOWS_SIGINT_EXIT_CODE,
};
use crate::download::{BinaryCache, Downloader};
use crate::error::{Error, Result};
use crate::lockfile::LockRegistry;
use crate::locator::{self, Location};

// =============================================================================
// State & Events
// =============================================================================

/// Lifecycle state of a supervised instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Constructed, never started (or fully cleaned up).
    New,
    /// `start` is in flight.
    Starting,
    /// The readiness line was observed; the instance is usable.
    Running,
    /// The server process is gone.
    Stopped,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::New => write!(f, "new"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Notifications fanned out to external observers.
///
/// `ReplState` and `Primary` are vestigial compatibility events emitted
/// when the server logs the corresponding transitions; nothing in the
/// supervisor acts on them.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// Fires on every state transition, in order, without skips.
    StateChange(InstanceState),
    /// The readiness line appeared.
    Ready,
    /// `start` completed; the instance is running.
    Started,
    /// A fatal condition was observed (output parsing or close).
    Error(String),
    /// The server process closed.
    Closed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// A replication-state line was observed.
    ReplState(String),
    /// The primary-transition line was observed.
    Primary,
}

// =============================================================================
// Options & Info
// =============================================================================

/// Auth material for the (currently unreachable) auth hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthOptions {
    pub root_user: String,
    pub root_password: String,
}

/// Hook point for provisioning credentials on a fresh instance.
///
/// The supervisor exposes the seam but does not invoke it from the start
/// pipeline yet; hosting programs may call it after `start` resolves.
#[async_trait]
pub trait AuthInitializer: Send + Sync {
    async fn initialize(&self, uri: &str, auth: &AuthOptions) -> Result<()>;
}

/// Caller-supplied instance options.
#[derive(Debug, Clone, Default)]
pub struct InstanceOpts {
    /// Requested port; occupied ports fall back to a free one unless
    /// `force_same_port` is set on `start`.
    pub port: Option<u16>,
    /// Data directory. Supplied directories are never auto-deleted;
    /// absent, a temp directory is created and owned by the supervisor.
    pub data_path: Option<PathBuf>,
    /// Bind/connect address, default `127.0.0.1`.
    pub ip: Option<String>,
    /// Readiness deadline, default 10 s, floor 1 s.
    pub launch_timeout: Option<Duration>,
    /// Extra arguments appended after `server <data_path>`.
    pub args: Vec<String>,
    /// Auth material for the auth hook.
    pub auth: Option<AuthOptions>,
}

/// Resolved description of a started instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub port: u16,
    pub data_path: PathBuf,
    pub ip: String,
    /// Set when the supervisor created the data directory itself.
    pub tmp_dir: Option<PathBuf>,
    pub launch_timeout: Duration,
    pub args: Vec<String>,
    /// Whether the data directory was empty at start.
    pub is_new: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Server pid, while known.
    pub pid: Option<u32>,
}

/// Cleanup behavior for `stop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOpts {
    /// Remove the supervisor-created temp data directory and return the
    /// instance to `New`.
    pub do_cleanup: bool,
    /// Additionally remove a caller-supplied data directory.
    pub force: bool,
}

// =============================================================================
// Monitor Plumbing
// =============================================================================

/// Internal signals raced by the start pipeline.
#[derive(Debug)]
enum MonitorSignal {
    Ready,
    Fatal(String),
    Closed {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Requests handled by the task owning the child process.
#[derive(Debug, Clone, Copy)]
enum KillRequest {
    Interrupt,
    Kill,
}

#[derive(Debug, Clone, Copy)]
struct ExitInfo {
    code: Option<i32>,
    signal: Option<i32>,
}

/// Handle to a spawned server: its pid, the exit observation channel,
/// and the kill-request channel into the owning task.
#[derive(Debug)]
struct ServerHandle {
    pid: u32,
    exited: watch::Receiver<Option<ExitInfo>>,
    kill: mpsc::UnboundedSender<KillRequest>,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Supervises one ephemeral server instance.
pub struct MinioInstance {
    config: ConfigResolver,
    opts: InstanceOpts,
    cache: Arc<BinaryCache>,
    locks: Arc<LockRegistry>,
    state: Arc<Mutex<InstanceState>>,
    events: broadcast::Sender<InstanceEvent>,
    server: Arc<Mutex<Option<ServerHandle>>>,
    reaper: Arc<tokio::sync::Mutex<Option<Child>>>,
    info: Arc<Mutex<Option<InstanceInfo>>>,
    tmp_dir: Arc<Mutex<Option<tempfile::TempDir>>>,
    is_primary: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

impl MinioInstance {
    /// Constructs an instance without starting it.
    pub fn new(opts: InstanceOpts) -> Self {
        Self::with_collaborators(
            ConfigResolver::from_process(),
            opts,
            BinaryCache::new(),
            LockRegistry::new(),
        )
    }

    /// Constructs an instance over explicit collaborators. Sharing the
    /// cache and lock registry across instances is what makes N
    /// concurrent `start`s download exactly once.
    pub fn with_collaborators(
        config: ConfigResolver,
        opts: InstanceOpts,
        cache: Arc<BinaryCache>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            opts,
            cache,
            locks,
            state: Arc::new(Mutex::new(InstanceState::New)),
            events,
            server: Arc::new(Mutex::new(None)),
            reaper: Arc::new(tokio::sync::Mutex::new(None)),
            info: Arc::new(Mutex::new(None)),
            tmp_dir: Arc::new(Mutex::new(None)),
            is_primary: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Constructs and starts an instance.
    pub async fn create(opts: InstanceOpts) -> Result<Self> {
        let instance = Self::new(opts);
        instance.start(false).await?;
        Ok(instance)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolved instance info, populated by `start`.
    pub fn instance_info(&self) -> Option<InstanceInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Whether the primary-transition line has been observed.
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Connection URI for the running instance, in the legacy
    /// `mongodb://<ip>:<port>/<db>` shape callers already parse.
    pub fn get_uri(&self, db: Option<&str>, ip: Option<&str>) -> Result<String> {
        let info = self
            .instance_info()
            .ok_or_else(|| Error::InstanceInfoMissing {
                operation: "get_uri",
                state: self.state(),
            })?;
        let host = ip.unwrap_or(&info.ip);
        Ok(format!(
            "mongodb://{}:{}/{}",
            host,
            info.port,
            db.unwrap_or("")
        ))
    }

    fn transition(&self, next: InstanceState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            debug!(from = %state, to = %next, "state transition");
            *state = next;
        }
        let _ = self.events.send(InstanceEvent::StateChange(next));
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts the instance: `New|Stopped → Starting → Running`.
    ///
    /// A `start` while already `Running` returns `Ok(())` without doing
    /// anything (the historical fall-through); a `start` while
    /// `Starting` fails - starts are single-flight.
    pub async fn start(&self, force_same_port: bool) -> Result<()> {
        // Check and claim the Starting slot under one lock so two racing
        // starts cannot both proceed.
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                InstanceState::Running => return Ok(()),
                InstanceState::Starting => {
                    return Err(Error::IncorrectState {
                        operation: "start",
                        allowed: &[InstanceState::New, InstanceState::Stopped],
                        actual: InstanceState::Starting,
                    });
                }
                InstanceState::New | InstanceState::Stopped => {
                    *state = InstanceState::Starting;
                }
            }
        }
        self.stopping.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(InstanceEvent::StateChange(InstanceState::Starting));

        match self.try_start(force_same_port).await {
            Ok(()) => {
                self.transition(InstanceState::Running);
                let _ = self.events.send(InstanceEvent::Started);
                info!(port = self.instance_info().map(|i| i.port), "instance started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "start failed; cleaning up");
                if let Err(stop_err) = self.stop(None).await {
                    debug!(error = %stop_err, "best-effort stop after failed start");
                }
                Err(e)
            }
        }
    }

    async fn try_start(&self, force_same_port: bool) -> Result<()> {
        // Port: keep the current/requested port under force_same_port,
        // otherwise probe and fall back to any free port.
        let existing_port = self
            .instance_info()
            .map(|i| i.port)
            .or(self.opts.port);
        let port = match (force_same_port, existing_port) {
            (true, Some(port)) => port,
            _ => select_free_port(self.opts.port).await?,
        };

        // Data directory.
        let (data_path, tmp_path, is_new) = self.resolve_data_dir().await?;

        // Binary.
        let binary = self.resolve_binary().await?;
        verify_binary(&binary)?;

        let ip = self
            .opts
            .ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let launch_timeout = self
            .opts
            .launch_timeout
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT)
            .max(MIN_LAUNCH_TIMEOUT);

        let mut args: Vec<String> = vec![
            SERVER_SUBCOMMAND.to_string(),
            data_path.to_string_lossy().into_owned(),
            "--address".to_string(),
            format!("{ip}:{port}"),
        ];
        args.extend(self.opts.args.iter().cloned());

        debug!(binary = %binary.display(), args = ?args, "spawning server");
        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&binary, &e))?;

        let pid = child.id().ok_or_else(|| Error::StartBinaryFailed {
            binary: binary.clone(),
            reason: "spawned process has no pid".to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(ServerHandle {
            pid,
            exited: exited_rx,
            kill: kill_tx,
        });
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(InstanceInfo {
            port,
            data_path: data_path.clone(),
            ip,
            tmp_dir: tmp_path,
            launch_timeout,
            args: self.opts.args.clone(),
            is_new,
            started_at: chrono::Utc::now(),
            pid: Some(pid),
        });

        // Reaper before readiness: an early supervisor death must not
        // leak a half-started server either.
        self.spawn_reaper(pid).await;

        self.spawn_output_parser(stdout, stderr, port, monitor_tx.clone());
        self.spawn_close_watcher(child, monitor_tx, exited_tx, kill_rx);

        // Race readiness against fatal output, early close, and the
        // launch timeout.
        tokio::select! {
            signal = monitor_rx.recv() => match signal {
                Some(MonitorSignal::Ready) => Ok(()),
                Some(MonitorSignal::Fatal(message)) => {
                    Err(Error::StdoutInstanceError(message))
                }
                Some(MonitorSignal::Closed { code, signal }) => {
                    Err(close_error(code, signal, "exited before becoming ready"))
                }
                None => Err(Error::StartBinaryFailed {
                    binary,
                    reason: "output monitor ended before readiness".to_string(),
                }),
            },
            _ = tokio::time::sleep(launch_timeout) => {
                Err(Error::LaunchTimeout(launch_timeout))
            }
        }
    }

    async fn resolve_data_dir(&self) -> Result<(PathBuf, Option<PathBuf>, bool)> {
        match &self.opts.data_path {
            Some(path) => {
                tokio::fs::create_dir_all(path).await?;
                let is_new = std::fs::read_dir(path)?.next().is_none();
                Ok((path.clone(), None, is_new))
            }
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix(TMP_DATA_DIR_PREFIX)
                    .tempdir()?;
                let path = tmp.path().to_path_buf();
                *self.tmp_dir.lock().unwrap_or_else(|e| e.into_inner()) = Some(tmp);
                Ok((path.clone(), Some(path), true))
            }
        }
    }

    async fn resolve_binary(&self) -> Result<PathBuf> {
        let req = crate::artifact::BinaryRequest::resolve(&self.config)?;
        match locator::locate(&self.config, &req)? {
            Location::Existing(path) => Ok(path),
            Location::Preferred(path) => {
                if !self.config.resolve_bool(ConfigKey::RuntimeDownload) {
                    return Err(Error::BinaryNotFound { path });
                }
                let downloader = Downloader::new(
                    self.config.clone(),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.locks),
                );
                downloader.provision(&req).await
            }
        }
    }

    /// Spawns the reaper sidecar: a detached shell loop polling both the
    /// supervisor pid and the server pid, SIGINT-ing the server once the
    /// supervisor is gone. The child handle is kept only so shutdown can
    /// terminate the reaper; it never blocks supervisor exit.
    #[cfg(unix)]
    async fn spawn_reaper(&self, server_pid: u32) {
        let parent = std::process::id();
        let script = format!(
            "while kill -0 {parent} 2>/dev/null && kill -0 {server_pid} 2>/dev/null; \
             do sleep 1; done; kill -2 {server_pid} 2>/dev/null"
        );
        match Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(reaper_pid = child.id(), server_pid, "reaper spawned");
                *self.reaper.lock().await = Some(child);
            }
            Err(e) => {
                // The instance still runs; it just isn't orphan-proof.
                warn!(error = %e, "failed to spawn reaper sidecar");
            }
        }
    }

    #[cfg(not(unix))]
    async fn spawn_reaper(&self, _server_pid: u32) {
        debug!("reaper sidecar not supported on this platform");
    }

    fn spawn_output_parser(
        &self,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        port: u16,
        monitor: mpsc::UnboundedSender<MonitorSignal>,
    ) {
        let ctx = ParserCtx {
            port,
            events: self.events.clone(),
            monitor,
            is_primary: Arc::clone(&self.is_primary),
            server: Arc::clone(&self.server),
        };

        if let Some(stdout) = stdout {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    parse_output_line(&line, OutputStream::Stdout, &ctx);
                }
            });
        }
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    parse_output_line(&line, OutputStream::Stderr, &ctx);
                }
            });
        }
    }

    fn spawn_close_watcher(
        &self,
        mut child: Child,
        monitor: mpsc::UnboundedSender<MonitorSignal>,
        exited_tx: watch::Sender<Option<ExitInfo>>,
        mut kill_rx: mpsc::UnboundedReceiver<KillRequest>,
    ) {
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let stopping = Arc::clone(&self.stopping);
        let info = Arc::clone(&self.info);

        tokio::spawn(async move {
            let mut kill_closed = false;
            let exit = loop {
                tokio::select! {
                    status = child.wait() => break decode_exit(status),
                    request = kill_rx.recv(), if !kill_closed => match request {
                        Some(KillRequest::Interrupt) => interrupt_child(&child),
                        Some(KillRequest::Kill) => {
                            let _ = child.start_kill();
                        }
                        None => kill_closed = true,
                    },
                }
            };

            debug!(code = ?exit.code, signal = ?exit.signal, "server process closed");
            if let Some(info) = info.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
                info.pid = None;
            }

            let expected = stopping.load(Ordering::SeqCst);
            let clean = matches!(exit.code, Some(0))
                || (cfg!(windows) && exit.code == Some(WINDOWS_SIGINT_EXIT_CODE));
            if !expected && !clean {
                let err = close_error(exit.code, exit.signal, "closed unexpectedly");
                error!(error = %err, "server closed with failure");
                let _ = events.send(InstanceEvent::Error(err.to_string()));

                // The supervisor reacts to its own error directly; the
                // broadcast above is for external observers.
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if *state == InstanceState::Running {
                    *state = InstanceState::Stopped;
                    drop(state);
                    let _ = events.send(InstanceEvent::StateChange(InstanceState::Stopped));
                }
            }

            let _ = events.send(InstanceEvent::Closed {
                code: exit.code,
                signal: exit.signal,
            });
            let _ = monitor.send(MonitorSignal::Closed {
                code: exit.code,
                signal: exit.signal,
            });
            let _ = exited_tx.send(Some(exit));
        });
    }

    // =========================================================================
    // Ensure
    // =========================================================================

    /// Waits for (or produces) a running instance.
    ///
    /// `Running` resolves immediately; `Starting` awaits the next state
    /// transition and fails unless it lands on `Running`; `New` and
    /// `Stopped` perform a `start`.
    pub async fn ensure_instance(&self) -> Result<()> {
        // Subscribe first so a transition between the state read and the
        // wait cannot be missed.
        let mut events = self.subscribe();
        match self.state() {
            InstanceState::Running => Ok(()),
            InstanceState::Starting => loop {
                match events.recv().await {
                    Ok(InstanceEvent::StateChange(InstanceState::Running)) => return Ok(()),
                    Ok(InstanceEvent::StateChange(other)) => {
                        return Err(Error::EnsureInstance { actual: other });
                    }
                    Ok(_) => continue,
                    Err(_) => {
                        return Err(Error::EnsureInstance {
                            actual: self.state(),
                        });
                    }
                }
            },
            InstanceState::New | InstanceState::Stopped => self.start(false).await,
        }
    }

    // =========================================================================
    // Stop & Cleanup
    // =========================================================================

    /// Stops the instance: two-phase termination of the server and the
    /// reaper, then `Stopped`. With cleanup options, additionally removes
    /// the data directory and returns to `New`.
    pub async fn stop(&self, cleanup: Option<CleanupOpts>) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let server = self
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = server {
            terminate_server(handle).await?;
        }

        let reaper = self.reaper.lock().await.take();
        if let Some(child) = reaper {
            terminate_reaper(child).await?;
        }

        self.is_primary.store(false, Ordering::SeqCst);
        self.transition(InstanceState::Stopped);

        if let Some(opts) = cleanup {
            if opts.do_cleanup {
                self.cleanup(opts).await?;
            }
        }
        Ok(())
    }

    /// Removes the instance's data on disk and returns to `New`.
    ///
    /// Refuses while the server process is still alive. A temp data
    /// directory created by the supervisor is always removed; a
    /// caller-supplied directory only under `force`, and only after
    /// verifying it is a directory.
    pub async fn cleanup(&self, opts: CleanupOpts) -> Result<()> {
        let alive = self
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| handle.exited.borrow().is_none());
        if alive {
            return Err(Error::IncorrectState {
                operation: "cleanup",
                allowed: &[InstanceState::Stopped, InstanceState::New],
                actual: self.state(),
            });
        }

        let tmp = self.tmp_dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tmp) = tmp {
            debug!(path = %tmp.path().display(), "removing temp data directory");
            tmp.close()?;
        }

        if opts.force {
            if let Some(path) = &self.opts.data_path {
                if path.exists() {
                    if !path.is_dir() {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("refusing to remove non-directory {}", path.display()),
                        )));
                    }
                    debug!(path = %path.display(), "force-removing data directory");
                    tokio::fs::remove_dir_all(path).await?;
                }
            }
        }

        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.transition(InstanceState::New);
        Ok(())
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone)]
struct ParserCtx {
    port: u16,
    events: broadcast::Sender<InstanceEvent>,
    monitor: mpsc::UnboundedSender<MonitorSignal>,
    is_primary: Arc<AtomicBool>,
    server: Arc<Mutex<Option<ServerHandle>>>,
}

mod patterns {
    use regex::Regex;
    use std::sync::OnceLock;

    macro_rules! pattern {
        ($name:ident, $re:literal) => {
            pub fn $name() -> &'static Regex {
                static RE: OnceLock<Regex> = OnceLock::new();
                RE.get_or_init(|| Regex::new($re).unwrap())
            }
        };
    }

    pattern!(ready_stderr, r"(?i)MinIO Object Storage Server");
    pattern!(ready_stdout, r"(?i)waiting for connections");
    pattern!(init_exception, r"exception in initAndListen: (?:\()?([^):]+)(?:\))?: (.+)");
    pattern!(missing_library, r"\b(lib[^:]+): cannot open shared object");
    pattern!(repl_transition, r"transition to ([A-Z0-9]+) from ([A-Z0-9]+)");
}

/// Scans one output line for readiness, fatal, and replication signals.
fn parse_output_line(line: &str, stream: OutputStream, ctx: &ParserCtx) {
    // Readiness.
    let ready = match stream {
        OutputStream::Stderr => patterns::ready_stderr().is_match(line),
        OutputStream::Stdout => patterns::ready_stdout().is_match(line),
    };
    if ready {
        let _ = ctx.events.send(InstanceEvent::Ready);
        let _ = ctx.monitor.send(MonitorSignal::Ready);
        return;
    }

    // Fatal conditions.
    let fatal = if line.contains("address already in use") {
        Some(format!("Port {} already in use", ctx.port))
    } else if line.contains("DBException in initAndListen,") {
        // Structured-log variant: the whole line is JSON and the message
        // lives under attr.error.
        let detail = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| {
                v.pointer("/attr/error")
                    .map(|e| e.to_string().trim_matches('"').to_string())
            })
            .unwrap_or_else(|| line.to_string());
        Some(detail)
    } else if let Some(caps) = patterns::init_exception().captures(line) {
        Some(format!("{}: {}", &caps[1], &caps[2]))
    } else if line.contains("CURL_OPENSSL_3 not found") {
        Some("libcurl3 is not available on this system".to_string())
    } else if line.contains("CURL_OPENSSL_4 not found") {
        Some("libcurl4 is not available on this system".to_string())
    } else if let Some(caps) = patterns::missing_library().captures(line) {
        Some(format!(
            "{} is missing; install the missing shared library",
            &caps[1]
        ))
    } else if line.contains("***aborting after") {
        Some("internal error: the server aborted".to_string())
    } else {
        None
    };

    if let Some(message) = fatal {
        error!(message = %message, "fatal server output");
        let _ = ctx.events.send(InstanceEvent::Error(message.clone()));
        let _ = ctx.monitor.send(MonitorSignal::Fatal(message));

        // Terminate directly rather than routing through the event bus;
        // the close watcher finishes the state bookkeeping.
        let handle = ctx.server.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(server) = handle.as_ref() {
            let _ = server.kill.send(KillRequest::Interrupt);
        }
        return;
    }

    // Replication transitions (vestigial compatibility events).
    if line.contains("transition to primary complete; database writes are now permitted") {
        ctx.is_primary.store(true, Ordering::SeqCst);
        let _ = ctx.events.send(InstanceEvent::Primary);
        return;
    }
    if let Some(caps) = patterns::repl_transition().captures(line) {
        let new_state = caps[1].to_string();
        if new_state != "PRIMARY" {
            ctx.is_primary.store(false, Ordering::SeqCst);
        }
        let _ = ctx.events.send(InstanceEvent::ReplState(new_state));
    }
}

// =============================================================================
// Process Helpers
// =============================================================================

/// Picks the instance port: the requested one when free, otherwise any
/// free port assigned by the OS.
async fn select_free_port(requested: Option<u16>) -> Result<u16> {
    if let Some(port) = requested {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(_listener) => return Ok(port),
            Err(_) => {
                debug!(port, "requested port occupied; picking a free one");
            }
        }
    }
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Best-effort chmod to 0755, then an execute check.
fn verify_binary(path: &Path) -> Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => {
            return Err(Error::BinaryNotFound {
                path: path.to_path_buf(),
            })
        }
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
        let mode = std::fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(meta.permissions().mode());
        if mode & 0o111 == 0 {
            return Err(Error::InsufficientPermissions {
                path: path.to_path_buf(),
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
    }
    Ok(())
}

fn spawn_error(binary: &Path, e: &std::io::Error) -> Error {
    let mut reason = e.to_string();
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) && reason.contains("-86") {
        reason.push_str(
            "; the binary is x86_64-only - install Rosetta 2 \
             (softwareupdate --install-rosetta) to run it",
        );
    }
    Error::StartBinaryFailed {
        binary: binary.to_path_buf(),
        reason,
    }
}

fn decode_exit(status: std::io::Result<std::process::ExitStatus>) -> ExitInfo {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            ExitInfo {
                code: status.code(),
                signal,
            }
        }
        Err(_) => ExitInfo {
            code: None,
            signal: None,
        },
    }
}

/// Builds the unexpected-close error, with the AVX hint for SIGILL and
/// the Windows runtime hint for very large exit codes.
fn close_error(code: Option<i32>, signal: Option<i32>, context: &str) -> Error {
    let mut hint = format!("; {context}");

    #[cfg(unix)]
    if signal == Some(nix::sys::signal::Signal::SIGILL as i32) {
        hint.push_str(
            "; the server was killed by SIGILL - the binary likely requires a CPU \
             with AVX support",
        );
    }
    if cfg!(windows) {
        if let Some(code) = code {
            if i64::from(code) > WINDOWS_RUNTIME_HINT_THRESHOLD {
                hint.push_str(
                    "; exit codes this large usually mean a missing C++ runtime - \
                     install the vc_redist package",
                );
            }
        }
    }

    Error::UnexpectedClose { code, signal, hint }
}

#[cfg(unix)]
fn interrupt_child(child: &Child) {
    if let Some(pid) = child.id() {
        if let Ok(pid) = i32::try_from(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGINT,
            );
        }
    }
}

#[cfg(not(unix))]
fn interrupt_child(child: &Child) {
    // No SIGINT delivery without a console; fall through to the hard
    // kill the caller escalates to.
    let _ = child;
}

/// Two-phase server termination: SIGINT, grace period, SIGKILL, grace
/// period, then give up.
async fn terminate_server(mut handle: ServerHandle) -> Result<()> {
    if handle.exited.borrow().is_some() {
        return Ok(());
    }

    debug!(pid = handle.pid, "interrupting server");
    let _ = handle.kill.send(KillRequest::Interrupt);
    if wait_for_exit(&mut handle.exited).await {
        return Ok(());
    }

    warn!(pid = handle.pid, "server ignored SIGINT; killing");
    let _ = handle.kill.send(KillRequest::Kill);
    if wait_for_exit(&mut handle.exited).await {
        return Ok(());
    }

    Err(Error::UnexpectedClose {
        code: None,
        signal: None,
        hint: format!(
            "; server pid {} survived SIGINT and SIGKILL",
            handle.pid
        ),
    })
}

async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitInfo>>) -> bool {
    tokio::time::timeout(KILL_GRACE_PERIOD, exited.wait_for(|e| e.is_some()))
        .await
        .is_ok()
}

/// Two-phase reaper termination; the reaper is our own child, so the
/// handle waits directly.
async fn terminate_reaper(mut child: Child) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    interrupt_child(&child);
    if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
        .await
        .is_ok()
    {
        return Ok(());
    }

    let _ = child.start_kill();
    tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
        .await
        .map_err(|_| Error::UnexpectedClose {
            code: None,
            signal: None,
            hint: "; reaper survived SIGINT and SIGKILL".to_string(),
        })??;
    Ok(())
}
