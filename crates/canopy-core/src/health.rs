//! Diagnostic checks
//!
//! Produces the check outputs the gateway's health endpoint reports:
//! disk headroom, git availability, container runtime, and registry
//! readability. Rendering is the UI's concern.

use serde::Serialize;
use std::path::Path;
use sysinfo::Disks;
use tracing::debug;

/// Severity of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

/// One named check with its outcome
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

/// Disk usage above this fraction is an error
const DISK_ERROR_THRESHOLD: f64 = 0.90;
/// Disk usage above this fraction is a warning
const DISK_WARNING_THRESHOLD: f64 = 0.80;

/// Classify a disk-usage fraction.
pub fn disk_status(used_fraction: f64) -> CheckStatus {
    if used_fraction > DISK_ERROR_THRESHOLD {
        CheckStatus::Error
    } else if used_fraction >= DISK_WARNING_THRESHOLD {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

/// Disk-space check for the filesystem holding `path`.
pub fn check_disk_space(path: &Path) -> HealthCheck {
    let disks = Disks::new_with_refreshed_list();

    // Pick the mount with the longest prefix of the target path.
    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    let Some(disk) = disk else {
        return HealthCheck {
            name: "disk-space",
            status: CheckStatus::Warning,
            detail: format!("no mount found for {}", path.display()),
        };
    };

    let total = disk.total_space();
    if total == 0 {
        return HealthCheck {
            name: "disk-space",
            status: CheckStatus::Warning,
            detail: "filesystem reports zero capacity".to_string(),
        };
    }
    let used = total - disk.available_space();
    let fraction = used as f64 / total as f64;
    debug!(
        category = "health",
        mount = %disk.mount_point().display(),
        used_percent = (fraction * 100.0) as u64,
        "Probed disk usage"
    );

    HealthCheck {
        name: "disk-space",
        status: disk_status(fraction),
        detail: format!("{:.0}% used", fraction * 100.0),
    }
}

/// Whether the git executable is reachable.
pub fn check_git() -> HealthCheck {
    match which::which("git") {
        Ok(path) => HealthCheck {
            name: "git",
            status: CheckStatus::Ok,
            detail: path.display().to_string(),
        },
        Err(_) => HealthCheck {
            name: "git",
            status: CheckStatus::Error,
            detail: "git executable not found".to_string(),
        },
    }
}

/// Whether the port registry file is readable (or absent, which loads
/// as empty).
pub fn check_registry_file(path: &Path) -> HealthCheck {
    if !path.exists() {
        return HealthCheck {
            name: "port-registry",
            status: CheckStatus::Ok,
            detail: "no registry file yet".to_string(),
        };
    }
    match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(_) => HealthCheck {
                name: "port-registry",
                status: CheckStatus::Ok,
                detail: "readable".to_string(),
            },
            Err(e) => HealthCheck {
                name: "port-registry",
                status: CheckStatus::Warning,
                detail: format!("malformed, will reload as empty: {e}"),
            },
        },
        Err(e) => HealthCheck {
            name: "port-registry",
            status: CheckStatus::Error,
            detail: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_thresholds() {
        assert_eq!(disk_status(0.10), CheckStatus::Ok);
        assert_eq!(disk_status(0.79), CheckStatus::Ok);
        assert_eq!(disk_status(0.80), CheckStatus::Warning);
        assert_eq!(disk_status(0.85), CheckStatus::Warning);
        assert_eq!(disk_status(0.90), CheckStatus::Warning);
        assert_eq!(disk_status(0.91), CheckStatus::Error);
        assert_eq!(disk_status(1.0), CheckStatus::Error);
    }

    #[test]
    fn test_check_git_present() {
        // git is a hard dependency of the whole tool
        let check = check_git();
        assert_eq!(check.name, "git");
    }

    #[test]
    fn test_registry_file_states() {
        let tmp = TempDir::new().unwrap();

        let absent = check_registry_file(&tmp.path().join("ports.json"));
        assert_eq!(absent.status, CheckStatus::Ok);

        let good = tmp.path().join("good.json");
        std::fs::write(&good, r#"{"a:api":3000}"#).unwrap();
        assert_eq!(check_registry_file(&good).status, CheckStatus::Ok);

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{nope").unwrap();
        assert_eq!(check_registry_file(&bad).status, CheckStatus::Warning);
    }

    #[test]
    fn test_check_disk_space_runs() {
        let check = check_disk_space(Path::new("/"));
        assert_eq!(check.name, "disk-space");
        assert!(!check.detail.is_empty());
    }
}
