//! Tests for the instance supervisor: the lifecycle state machine,
//! readiness and fatal-output detection, port handling, shutdown, and
//! data-directory cleanup.
//!
//! The "server" is a shell script printing the readiness (or failure)
//! lines the real binary would, so the whole pipeline runs without a
//! network.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minio_test_server::{
    lockfile, CleanupOpts, ConfigResolver, Error, InstanceEvent, InstanceOpts, InstanceState,
    MinioInstance,
};
use minio_test_server::{BinaryCache, LockRegistry};

// =============================================================================
// Fake Binaries
// =============================================================================

/// Writes an executable script into `dir` and returns its path.
fn fake_binary(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A well-behaved server: announces readiness on stderr, then idles
/// until interrupted.
fn ready_server(dir: &Path) -> PathBuf {
    fake_binary(
        dir,
        "fake-minio",
        "#!/bin/sh\n\
         trap 'exit 0' INT TERM\n\
         echo \"MinIO Object Storage Server -- version TEST.2024\" 1>&2\n\
         while :; do sleep 0.2; done\n",
    )
}

/// A server that dies during init with a parseable exception.
fn crashing_server(dir: &Path) -> PathBuf {
    fake_binary(
        dir,
        "crashing-minio",
        "#!/bin/sh\n\
         echo \"exception in initAndListen: InvalidBSON: bad magic\"\n\
         sleep 2\n\
         exit 14\n",
    )
}

/// A server that reports its port as taken.
fn port_clash_server(dir: &Path) -> PathBuf {
    fake_binary(
        dir,
        "clashing-minio",
        "#!/bin/sh\n\
         echo \"ERROR: listen tcp: address already in use\" 1>&2\n\
         sleep 2\n\
         exit 1\n",
    )
}

/// A server that never becomes ready.
fn silent_server(dir: &Path) -> PathBuf {
    fake_binary(
        dir,
        "silent-minio",
        "#!/bin/sh\n\
         trap 'exit 0' INT TERM\n\
         while :; do sleep 0.2; done\n",
    )
}

fn instance(binary: &Path, opts: InstanceOpts) -> MinioInstance {
    let env: HashMap<String, String> = [(
        "MINIOTST_SYSTEM_BINARY".to_string(),
        binary.to_string_lossy().into_owned(),
    )]
    .into();
    MinioInstance::with_collaborators(
        ConfigResolver::with_env_and_manifest(env, None),
        opts,
        BinaryCache::new(),
        LockRegistry::new(),
    )
}

// =============================================================================
// Start / Readiness
// =============================================================================

#[tokio::test]
async fn test_start_reaches_running_and_get_uri() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let data = temp.path().join("data");

    let server = instance(
        &binary,
        InstanceOpts {
            port: Some(63208),
            data_path: Some(data.clone()),
            ..InstanceOpts::default()
        },
    );

    server.start(false).await.unwrap();
    assert_eq!(server.state(), InstanceState::Running);

    let info = server.instance_info().unwrap();
    assert_eq!(info.port, 63208);
    assert_eq!(info.data_path, data);
    assert!(info.tmp_dir.is_none());
    assert!(info.is_new, "a fresh data directory counts as new");

    assert_eq!(
        server.get_uri(None, None).unwrap(),
        "mongodb://127.0.0.1:63208/"
    );
    assert_eq!(
        server.get_uri(Some("test-db"), None).unwrap(),
        "mongodb://127.0.0.1:63208/test-db"
    );

    server.stop(None).await.unwrap();
    assert_eq!(server.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_create_is_construct_plus_start() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());

    // `create` resolves configuration from the process, so the binary is
    // routed through the environment. No other test reads MINIOTST_*
    // from the process environment, so this cannot race.
    std::env::set_var("MINIOTST_SYSTEM_BINARY", &binary);
    let result = MinioInstance::create(InstanceOpts::default()).await;
    std::env::remove_var("MINIOTST_SYSTEM_BINARY");

    let server = result.unwrap();
    assert_eq!(server.state(), InstanceState::Running);
    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_state_change_notifications_in_order() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    let mut events = server.subscribe();
    server.start(false).await.unwrap();
    server.stop(None).await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let InstanceEvent::StateChange(state) = event {
            transitions.push(state);
        }
    }
    assert_eq!(
        transitions,
        vec![
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopped
        ],
        "one notification per transition, in order, no skips"
    );
}

#[tokio::test]
async fn test_start_while_starting_is_rejected() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = silent_server(temp.path());
    let server = std::sync::Arc::new(instance(
        &binary,
        InstanceOpts {
            launch_timeout: Some(Duration::from_secs(5)),
            ..InstanceOpts::default()
        },
    ));

    let racing = std::sync::Arc::clone(&server);
    let first = tokio::spawn(async move { racing.start(false).await });

    // Give the first start a moment to enter Starting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.state(), InstanceState::Starting);
    let err = server.start(false).await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState { .. }), "{err}");

    // The silent server never becomes ready; the first start times out.
    let result = first.await.unwrap();
    assert!(matches!(result, Err(Error::LaunchTimeout(_))));
    assert_eq!(server.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_start_stop_start_cycle() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    server.start(false).await.unwrap();
    let first_pid = server.instance_info().unwrap().pid.unwrap();
    server.stop(None).await.unwrap();
    assert_eq!(server.state(), InstanceState::Stopped);

    server.start(false).await.unwrap();
    assert_eq!(server.state(), InstanceState::Running);
    let second_pid = server.instance_info().unwrap().pid.unwrap();
    assert_ne!(first_pid, second_pid);

    server.stop(None).await.unwrap();
}

// =============================================================================
// Failure Detection
// =============================================================================

#[tokio::test]
async fn test_crash_during_init_is_reported() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = crashing_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    let err = server.start(false).await.unwrap_err();
    assert!(
        err.to_string().contains("InvalidBSON"),
        "error must carry the parsed exception: {err}"
    );
    assert_eq!(server.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_port_clash_output_is_fatal() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = port_clash_server(temp.path());

    // Occupy a port and insist on it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = listener.local_addr().unwrap().port();

    let server = instance(
        &binary,
        InstanceOpts {
            port: Some(occupied),
            ..InstanceOpts::default()
        },
    );
    let err = server.start(true).await.unwrap_err();
    match err {
        Error::StdoutInstanceError(message) => {
            assert!(message.contains("already in use"), "message: {message}");
            assert!(message.contains(&occupied.to_string()));
        }
        other => panic!("expected StdoutInstanceError, got {other}"),
    }
    assert_eq!(server.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_occupied_port_falls_back_to_free_one() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = listener.local_addr().unwrap().port();

    let server = instance(
        &binary,
        InstanceOpts {
            port: Some(occupied),
            ..InstanceOpts::default()
        },
    );
    server.start(false).await.unwrap();

    let chosen = server.instance_info().unwrap().port;
    assert_ne!(chosen, occupied, "an occupied port must not be reused");

    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_launch_timeout_fires() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = silent_server(temp.path());
    let server = instance(
        &binary,
        InstanceOpts {
            launch_timeout: Some(Duration::from_secs(1)),
            ..InstanceOpts::default()
        },
    );

    let started = std::time::Instant::now();
    let err = server.start(false).await.unwrap_err();
    assert!(matches!(err, Error::LaunchTimeout(_)), "{err}");
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "timeout must fire near the configured deadline"
    );
    assert_eq!(server.state(), InstanceState::Stopped);
}

#[tokio::test]
async fn test_missing_binary_is_reported() {
    let temp = tempfile::TempDir::new().unwrap();
    let env: HashMap<String, String> = [
        (
            "MINIOTST_SYSTEM_BINARY".to_string(),
            temp.path().join("no-such-binary").to_string_lossy().into_owned(),
        ),
        ("MINIOTST_RUNTIME_DOWNLOAD".to_string(), "false".to_string()),
        (
            "MINIOTST_DOWNLOAD_DIR".to_string(),
            temp.path().to_string_lossy().into_owned(),
        ),
    ]
    .into();
    let server = MinioInstance::with_collaborators(
        ConfigResolver::with_env_and_manifest(env, None),
        InstanceOpts::default(),
        BinaryCache::new(),
        LockRegistry::new(),
    );

    let err = server.start(false).await.unwrap_err();
    assert!(matches!(err, Error::BinaryNotFound { .. }), "{err}");
    assert_eq!(server.state(), InstanceState::Stopped);
}

// =============================================================================
// Shutdown & Cleanup
// =============================================================================

#[tokio::test]
async fn test_stop_leaves_no_child_alive() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    server.start(false).await.unwrap();
    let pid = server.instance_info().unwrap().pid.unwrap();
    assert!(lockfile::pid_alive(pid));

    server.stop(None).await.unwrap();
    // The watcher observed the exit, so the pid is down (modulo reuse,
    // which a fresh pid in a short-lived test will not hit).
    assert!(!lockfile::pid_alive(pid), "server must be dead after stop");
}

#[tokio::test]
async fn test_cleanup_removes_tmp_dir_and_returns_to_new() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    server.start(false).await.unwrap();
    let tmp_dir = server.instance_info().unwrap().tmp_dir.unwrap();
    assert!(tmp_dir.exists());
    assert!(tmp_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("minio-tst-"));

    server
        .stop(Some(CleanupOpts {
            do_cleanup: true,
            force: false,
        }))
        .await
        .unwrap();

    assert!(!tmp_dir.exists(), "temp data directory must be removed");
    assert_eq!(server.state(), InstanceState::New);
}

#[tokio::test]
async fn test_cleanup_preserves_supplied_data_dir() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let data = temp.path().join("precious-data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("objects.bin"), b"payload").unwrap();

    let server = instance(
        &binary,
        InstanceOpts {
            data_path: Some(data.clone()),
            ..InstanceOpts::default()
        },
    );
    server.start(false).await.unwrap();
    assert!(
        !server.instance_info().unwrap().is_new,
        "a non-empty supplied directory is not new"
    );

    server
        .stop(Some(CleanupOpts {
            do_cleanup: true,
            force: false,
        }))
        .await
        .unwrap();

    assert!(data.exists(), "supplied data directory must survive cleanup");
    assert!(data.join("objects.bin").exists());
}

#[tokio::test]
async fn test_force_cleanup_removes_supplied_data_dir() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let data = temp.path().join("disposable-data");
    std::fs::create_dir_all(&data).unwrap();

    let server = instance(
        &binary,
        InstanceOpts {
            data_path: Some(data.clone()),
            ..InstanceOpts::default()
        },
    );
    server.start(false).await.unwrap();
    server
        .stop(Some(CleanupOpts {
            do_cleanup: true,
            force: true,
        }))
        .await
        .unwrap();

    assert!(!data.exists(), "force cleanup removes the supplied directory");
}

#[tokio::test]
async fn test_cleanup_refuses_while_running() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    server.start(false).await.unwrap();
    let err = server
        .cleanup(CleanupOpts {
            do_cleanup: true,
            force: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::IncorrectState { .. }), "{err}");

    server.stop(None).await.unwrap();
}

// =============================================================================
// Ensure
// =============================================================================

#[tokio::test]
async fn test_ensure_instance_starts_from_new() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = instance(&binary, InstanceOpts::default());

    server.ensure_instance().await.unwrap();
    assert_eq!(server.state(), InstanceState::Running);

    // Already running: resolves immediately.
    server.ensure_instance().await.unwrap();

    server.stop(None).await.unwrap();

    // Stopped: starts again.
    server.ensure_instance().await.unwrap();
    assert_eq!(server.state(), InstanceState::Running);
    server.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_ensure_instance_waits_out_a_concurrent_start() {
    let temp = tempfile::TempDir::new().unwrap();
    let binary = ready_server(temp.path());
    let server = std::sync::Arc::new(instance(&binary, InstanceOpts::default()));

    let starter = std::sync::Arc::clone(&server);
    let start_task = tokio::spawn(async move { starter.start(false).await });

    // Let the spawned start enter Starting, then ensure from a second
    // caller: it must wait out the in-flight start and observe Running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.ensure_instance().await.unwrap();
    assert_eq!(server.state(), InstanceState::Running);

    let _ = start_task.await.unwrap();
    server.stop(None).await.unwrap();
}
