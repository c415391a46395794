//! Host platform detection.
//!
//! Classifies the host into `{os, distro, release}` for the artifact
//! resolver. Non-Linux hosts carry the OS name only; Linux hosts are
//! probed through the usual release files, in order:
//!
//! | Source                               | Format    |
//! |--------------------------------------|-----------|
//! | `/etc/upstream-release/lsb-release`  | LSB       |
//! | `/etc/os-release`                    | key=value |
//! | `/usr/lib/os-release`                | key=value |
//! | `/etc/lsb-release`                   | LSB       |
//!
//! The first source yielding a distro other than `"unknown"` wins. The
//! probe result is memoized for the process lifetime.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Release files consulted on Linux, in priority order. Derivatives such
/// as Linux Mint describe their Ubuntu base in `upstream-release`, which
/// is why it outranks `os-release`.
const RELEASE_FILE_SOURCES: &[(&str, ReleaseFileFormat)] = &[
    ("/etc/upstream-release/lsb-release", ReleaseFileFormat::Lsb),
    ("/etc/os-release", ReleaseFileFormat::OsRelease),
    ("/usr/lib/os-release", ReleaseFileFormat::OsRelease),
    ("/etc/lsb-release", ReleaseFileFormat::Lsb),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseFileFormat {
    Lsb,
    OsRelease,
}

// =============================================================================
// OS Descriptor
// =============================================================================

/// Descriptor of the host operating system.
///
/// For any descriptor returned as valid, `distro` is never `"unknown"`;
/// the probe falls through to the next source instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// Operating system (`linux`, `darwin`, `windows`, ...).
    pub os: String,
    /// Linux distribution id, lowercased (`ubuntu`, `rhel`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<String>,
    /// Distribution release (`22.04`, `9.2`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Release codename when the source carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codename: Option<String>,
    /// Parent distributions, most specific first (`ID_LIKE`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub id_like: Vec<String>,
}

impl OsInfo {
    /// Descriptor carrying only an OS name (non-Linux hosts).
    pub fn bare(os: &str) -> Self {
        Self {
            os: os.to_string(),
            ..Self::default()
        }
    }

    /// The distro, or `"unknown"` when none was detected.
    pub fn distro_or_unknown(&self) -> &str {
        self.distro.as_deref().unwrap_or("unknown")
    }

    /// The release, or an empty string.
    pub fn release_str(&self) -> &str {
        self.release.as_deref().unwrap_or("")
    }

    fn has_distro(&self) -> bool {
        self.distro.as_deref().is_some_and(|d| d != "unknown")
    }
}

// =============================================================================
// Probe
// =============================================================================

/// Detects the host OS descriptor, memoized for the process lifetime.
pub fn probe() -> &'static OsInfo {
    static PROBED: OnceLock<OsInfo> = OnceLock::new();
    PROBED.get_or_init(detect)
}

/// The host OS name as the artifact resolver spells it.
pub fn host_os() -> &'static str {
    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(target_os = "macos")]
    return "darwin";

    #[cfg(target_os = "windows")]
    return "win32";

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return std::env::consts::OS;
}

/// The host architecture as reported by the toolchain (`x86_64`,
/// `aarch64`, ...), the spelling the arch translation accepts.
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

fn detect() -> OsInfo {
    if host_os() != "linux" {
        return OsInfo::bare(host_os());
    }
    detect_linux(Path::new("/"))
}

/// Linux detection over a filesystem root. Tests point this at a
/// directory of fixture files instead of `/`.
pub fn detect_linux(root: &Path) -> OsInfo {
    for (source, format) in RELEASE_FILE_SOURCES {
        let path = root.join(source.trim_start_matches('/'));
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => continue,
        };

        let info = match format {
            ReleaseFileFormat::Lsb => parse_lsb(&contents),
            ReleaseFileFormat::OsRelease => parse_os_release(&contents),
        };

        if info.has_distro() {
            debug!(source = *source, distro = info.distro_or_unknown(), "probed host distro");
            return info;
        }
    }

    warn!("unable to determine the Linux distribution; distro-specific binaries unavailable");
    OsInfo {
        os: "linux".to_string(),
        distro: Some("unknown".to_string()),
        release: Some(String::new()),
        ..OsInfo::default()
    }
}

// =============================================================================
// Release File Parsing
// =============================================================================

/// Parses LSB content, accepting both the `lsb_release -a` command style
/// (`Distributor ID:\tUbuntu`) and the `/etc/lsb-release` file style
/// (`DISTRIB_ID=Ubuntu`).
pub fn parse_lsb(contents: &str) -> OsInfo {
    static NAME: OnceLock<Regex> = OnceLock::new();
    static CODENAME: OnceLock<Regex> = OnceLock::new();
    static RELEASE: OnceLock<Regex> = OnceLock::new();

    let name = NAME.get_or_init(|| {
        Regex::new(r#"(?im)^(?:distributor id:|distrib_id=)\s*"?([^"\r\n]+)"?"#).unwrap()
    });
    let codename = CODENAME.get_or_init(|| {
        Regex::new(r#"(?im)^(?:codename:|distrib_codename=)\s*"?([^"\r\n]+)"?"#).unwrap()
    });
    let release = RELEASE.get_or_init(|| {
        Regex::new(r#"(?im)^(?:release:|distrib_release=)\s*"?([^"\r\n]+)"?"#).unwrap()
    });

    let capture = |re: &Regex| {
        re.captures(contents)
            .map(|c| c[1].trim().to_string())
            .filter(|v| !v.is_empty())
    };

    OsInfo {
        os: "linux".to_string(),
        distro: capture(name).map(|d| d.to_lowercase()).or_else(|| Some("unknown".to_string())),
        release: capture(release),
        codename: capture(codename),
        id_like: Vec::new(),
    }
}

/// Parses `os-release` key=value content, capturing `ID`, `VERSION_ID`,
/// `VERSION_CODENAME` and `ID_LIKE` (whitespace-separated).
pub fn parse_os_release(contents: &str) -> OsInfo {
    let mut info = OsInfo {
        os: "linux".to_string(),
        ..OsInfo::default()
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "ID" => info.distro = Some(value.to_lowercase()),
            "VERSION_ID" => info.release = Some(value.to_string()),
            "VERSION_CODENAME" => info.codename = Some(value.to_string()),
            "ID_LIKE" => {
                info.id_like = value
                    .split_whitespace()
                    .map(|s| s.to_lowercase())
                    .collect();
            }
            _ => {}
        }
    }

    if info.distro.is_none() {
        info.distro = Some("unknown".to_string());
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    const UBUNTU_OS_RELEASE: &str = r#"
PRETTY_NAME="Ubuntu 22.04.4 LTS"
NAME="Ubuntu"
VERSION_ID="22.04"
VERSION_CODENAME=jammy
ID=ubuntu
ID_LIKE=debian
"#;

    const MINT_LSB: &str = "DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=22.04\nDISTRIB_CODENAME=jammy\n";

    const LSB_COMMAND_STYLE: &str = "Distributor ID:\tDebian\nDescription:\tDebian GNU/Linux 11\nRelease:\t11\nCodename:\tbullseye\n";

    #[test]
    fn test_parse_os_release_ubuntu() {
        let info = parse_os_release(UBUNTU_OS_RELEASE);
        assert_eq!(info.distro.as_deref(), Some("ubuntu"));
        assert_eq!(info.release.as_deref(), Some("22.04"));
        assert_eq!(info.codename.as_deref(), Some("jammy"));
        assert_eq!(info.id_like, vec!["debian"]);
    }

    #[test]
    fn test_parse_lsb_file_style() {
        let info = parse_lsb(MINT_LSB);
        assert_eq!(info.distro.as_deref(), Some("ubuntu"));
        assert_eq!(info.release.as_deref(), Some("22.04"));
        assert_eq!(info.codename.as_deref(), Some("jammy"));
    }

    #[test]
    fn test_parse_lsb_command_style() {
        let info = parse_lsb(LSB_COMMAND_STYLE);
        assert_eq!(info.distro.as_deref(), Some("debian"));
        assert_eq!(info.release.as_deref(), Some("11"));
        assert_eq!(info.codename.as_deref(), Some("bullseye"));
    }

    #[test]
    fn test_parse_os_release_without_id_is_unknown() {
        let info = parse_os_release("PRETTY_NAME=\"Mystery Linux\"\n");
        assert_eq!(info.distro.as_deref(), Some("unknown"));
        assert!(!info.has_distro());
    }

    #[test]
    fn test_detect_linux_prefers_upstream_release() {
        let temp = tempfile::TempDir::new().unwrap();
        let upstream = temp.path().join("etc/upstream-release");
        std::fs::create_dir_all(&upstream).unwrap();
        std::fs::write(upstream.join("lsb-release"), MINT_LSB).unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(
            temp.path().join("etc/os-release"),
            "ID=linuxmint\nVERSION_ID=\"21.3\"\n",
        )
        .unwrap();

        let info = detect_linux(temp.path());
        assert_eq!(info.distro.as_deref(), Some("ubuntu"));
        assert_eq!(info.release.as_deref(), Some("22.04"));
    }

    #[test]
    fn test_detect_linux_falls_through_to_os_release() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("etc/os-release"), UBUNTU_OS_RELEASE).unwrap();

        let info = detect_linux(temp.path());
        assert_eq!(info.distro.as_deref(), Some("ubuntu"));
    }

    #[test]
    fn test_detect_linux_unknown_when_no_sources() {
        let temp = tempfile::TempDir::new().unwrap();
        let info = detect_linux(temp.path());
        assert_eq!(info.distro.as_deref(), Some("unknown"));
        assert_eq!(info.release.as_deref(), Some(""));
    }

    #[test]
    fn test_probe_memoizes() {
        let first = probe() as *const OsInfo;
        let second = probe() as *const OsInfo;
        assert_eq!(first, second);
    }
}
