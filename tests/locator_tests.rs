//! Tests for the cached-binary locator's search and preference order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use minio_test_server::locator::{candidates_at, locate_at, Location};
use minio_test_server::{BinaryRequest, ConfigResolver, OsInfo, ServerVersion};

const NAME: &str = "mongod-amd64-ubuntu2204-7.0.14";

fn request(download_dir: Option<&Path>, system_binary: Option<&Path>) -> BinaryRequest {
    BinaryRequest {
        version: ServerVersion::parse("7.0.14").unwrap(),
        os: OsInfo {
            os: "linux".to_string(),
            distro: Some("ubuntu".to_string()),
            release: Some("22.04".to_string()),
            ..OsInfo::default()
        },
        platform: "linux".to_string(),
        arch: "amd64".to_string(),
        download_dir: download_dir.map(Path::to_path_buf),
        system_binary: system_binary.map(Path::to_path_buf),
        check_md5: false,
    }
}

fn config(pairs: &[(&str, &str)]) -> ConfigResolver {
    let env: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ConfigResolver::with_env_and_manifest(env, None)
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

// =============================================================================
// Candidate Enumeration
// =============================================================================

#[test]
fn test_candidate_paths() {
    let cwd = PathBuf::from("/work/project");
    let home = PathBuf::from("/home/dev");
    let dl = PathBuf::from("/opt/minio-cache");

    let candidates = candidates_at(
        &config(&[]),
        &request(Some(&dl), None),
        &cwd,
        Some(&home),
    )
    .unwrap();

    assert_eq!(candidates.config_path, Some(dl.join(NAME)));
    assert_eq!(
        candidates.legacy_home,
        Some(home.join(".cache/minio-binaries").join(NAME))
    );
    assert_eq!(
        candidates.modules_cache,
        Some(cwd.join(".cache/minio-binaries").join(NAME))
    );
    assert_eq!(
        candidates.relative,
        Some(cwd.join("minio-binaries").join(NAME))
    );
}

#[test]
fn test_embedded_install_resolves_to_host_project_cache() {
    let cwd = PathBuf::from("/work/project/node_modules/minio-test-server-core");
    let candidates = candidates_at(&config(&[]), &request(None, None), &cwd, None).unwrap();

    assert_eq!(
        candidates.modules_cache,
        Some(PathBuf::from("/work/project/.cache/minio-binaries").join(NAME))
    );
}

// =============================================================================
// Search Order
// =============================================================================

#[test]
fn test_search_order_config_home_project_relative() {
    let temp = tempfile::TempDir::new().unwrap();
    let cwd = temp.path().join("cwd");
    let home = temp.path().join("home");
    let dl = temp.path().join("dl");

    // Seed every candidate; the config path must win.
    touch(&dl.join(NAME));
    touch(&home.join(".cache/minio-binaries").join(NAME));
    touch(&cwd.join(".cache/minio-binaries").join(NAME));
    touch(&cwd.join("minio-binaries").join(NAME));

    let loc = locate_at(
        &config(&[]),
        &request(Some(&dl), None),
        &cwd,
        Some(&home),
    )
    .unwrap();
    assert_eq!(loc, Location::Existing(dl.join(NAME)));

    // Without a config path the home cache wins.
    let loc = locate_at(&config(&[]), &request(None, None), &cwd, Some(&home)).unwrap();
    assert_eq!(
        loc,
        Location::Existing(home.join(".cache/minio-binaries").join(NAME))
    );

    // Without a home dir the project cache wins over cwd-relative.
    let loc = locate_at(&config(&[]), &request(None, None), &cwd, None).unwrap();
    assert_eq!(
        loc,
        Location::Existing(cwd.join(".cache/minio-binaries").join(NAME))
    );
}

#[test]
fn test_system_binary_wins_over_everything() {
    let temp = tempfile::TempDir::new().unwrap();
    let system = temp.path().join("preinstalled-minio");
    touch(&system);
    let dl = temp.path().join("dl");
    touch(&dl.join(NAME));

    let loc = locate_at(
        &config(&[]),
        &request(Some(&dl), Some(&system)),
        temp.path(),
        None,
    )
    .unwrap();
    assert_eq!(loc, Location::Existing(system));
}

// =============================================================================
// Download Preference
// =============================================================================

#[test]
fn test_preference_order_for_downloads() {
    let temp = tempfile::TempDir::new().unwrap();
    let cwd = temp.path().join("cwd");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&cwd).unwrap();

    // Configured directory first.
    let dl = temp.path().join("dl");
    let loc = locate_at(
        &config(&[]),
        &request(Some(&dl), None),
        &cwd,
        Some(&home),
    )
    .unwrap();
    assert_eq!(loc, Location::Preferred(dl.join(NAME)));

    // Global home cache by default.
    let loc = locate_at(&config(&[]), &request(None, None), &cwd, Some(&home)).unwrap();
    assert_eq!(
        loc,
        Location::Preferred(home.join(".cache/minio-binaries").join(NAME))
    );

    // Project cache when the global path is disabled.
    let loc = locate_at(
        &config(&[("MINIOTST_PREFER_GLOBAL_PATH", "0")]),
        &request(None, None),
        &cwd,
        Some(&home),
    )
    .unwrap();
    assert_eq!(
        loc,
        Location::Preferred(cwd.join(".cache/minio-binaries").join(NAME))
    );
}
