//! # minio-test-server
//!
//! **Ephemeral object-storage server supervisor for integration tests**
//!
//! Give it a version; it resolves the right platform-specific artifact,
//! downloads and verifies it (coordinating across processes so parallel
//! test runs share a cache without racing), then supervises the server
//! binary as a child process and guarantees orderly cleanup.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        minio-test-server                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                   MinioInstance (supervisor)                │    │
//! │  │   start → [Starting] → readiness race → [Running]           │    │
//! │  │   stop  → SIGINT → SIGKILL → [Stopped] → cleanup → [New]    │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │ needs a binary                    │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │        locator: system path │ config dir │ home cache       │    │
//! │  │                 │ project cache │ cwd-relative              │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │ cache miss                        │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │   Downloader: lockfile → HTTP stream → MD5 → extract        │    │
//! │  │   exactly one download per version across processes         │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  config: env → Cargo.toml metadata → defaults                       │
//! │  platform: os/arch/distro probe      artifact: URL + names          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use minio_test_server::{InstanceOpts, MinioInstance};
//!
//! #[tokio::main]
//! async fn main() -> minio_test_server::Result<()> {
//!     // Downloads (or reuses) the pinned server version, spawns it on
//!     // a free port, and resolves once the readiness line appears.
//!     let server = MinioInstance::create(InstanceOpts::default()).await?;
//!
//!     let uri = server.get_uri(None, None)?;
//!     // ... run the code under test against `uri` ...
//!
//!     server.stop(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Every option can come from the environment (`MINIOTST_*`), from the
//! project's `Cargo.toml` under `[package.metadata.minio-test-server]`
//! (camelCase keys), or from built-in defaults - see [`config`].
//!
//! # Cross-Process Coordination
//!
//! Concurrent provisions of the same version - within one process or
//! across many - perform exactly one download. The serialization points
//! are the per-version lockfile (`<download_dir>/<version>.lock`, see
//! [`lockfile`]) and the in-process [`download::BinaryCache`].
//!
//! # Orphan-Proofing
//!
//! Every spawned server gets a detached reaper sidecar watching the
//! supervising process; if the test run dies without cleanup, the reaper
//! SIGINTs the server. No instance outlives its test.

// =============================================================================
// Modules
// =============================================================================

mod constants;
mod error;

pub mod artifact;
pub mod config;
pub mod download;
pub mod instance;
pub mod lockfile;
pub mod locator;
pub mod platform;

// =============================================================================
// Re-exports
// =============================================================================

pub use artifact::{BinaryRequest, ServerVersion};
pub use config::{ConfigKey, ConfigResolver};
pub use download::{BinaryCache, Downloader};
pub use error::{Error, Result};
pub use instance::{
    AuthInitializer, AuthOptions, CleanupOpts, InstanceEvent, InstanceInfo, InstanceOpts,
    InstanceState, MinioInstance,
};
pub use lockfile::{LockHandle, LockRegistry};
pub use locator::Location;
pub use platform::OsInfo;
