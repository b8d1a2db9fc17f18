//! Device descriptor collection.
//!
//! Built once at process start and treated as an immutable snapshot
//! afterwards. Every field degrades to a fallback value rather than
//! failing - a machine that cannot report its hostname can still pair.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sysinfo::System;
use tracing::{debug, warn};
use uuid::Uuid;

/// Application name used for the data directory path
const APP_NAME: &str = "tether";

/// File holding the randomly generated stable device id
const DEVICE_ID_FILE: &str = "device_id.txt";

const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub hostname: String,
    pub platform: String,
    pub release: String,
    pub arch: String,
    pub cpus: usize,
    /// Total memory in GB
    pub total_memory: u64,
    pub os_type: String,
    pub device_id: String,
    pub device_fingerprint: String,
}

impl DeviceInfo {
    /// Collect the descriptor for this machine.
    pub fn collect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let device_id = stable_device_id().unwrap_or_else(|e| {
            warn!(error = %e, "Could not persist a device id, using a transient one");
            Uuid::new_v4().to_string()
        });

        let device_fingerprint = machine_fingerprint().unwrap_or_else(|e| {
            // Fall back to hashing the device id so the fingerprint is
            // at least stable for this install.
            warn!(error = %e, "Could not read machine id, deriving fingerprint from device id");
            sha256_hex(device_id.as_bytes())
        });

        let platform = if cfg!(target_os = "windows") {
            "Windows"
        } else if cfg!(target_os = "macos") {
            "macOS"
        } else if cfg!(target_os = "linux") {
            "Linux"
        } else {
            UNKNOWN
        };

        let arch = if cfg!(target_arch = "x86_64") {
            "x64"
        } else if cfg!(target_arch = "aarch64") {
            "arm64"
        } else {
            std::env::consts::ARCH
        };

        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .or_else(System::host_name)
            .unwrap_or_else(|| UNKNOWN.to_string());

        let info = Self {
            hostname,
            platform: platform.to_string(),
            release: os_release(),
            arch: arch.to_string(),
            cpus: sys.cpus().len(),
            total_memory: sys.total_memory() / (1024 * 1024 * 1024),
            os_type: platform.to_string(),
            device_id,
            device_fingerprint,
        };
        debug!(
            hostname = %info.hostname,
            platform = %info.platform,
            fingerprint = %info.device_fingerprint,
            "Device descriptor collected"
        );
        info
    }
}

/// Hex SHA-256 of the OS machine id. Stable across reinstalls of the
/// agent, which is what ties pairing steps to the same device.
fn machine_fingerprint() -> Result<String> {
    let machine_id = machine_uid::get()
        .map_err(|e| anyhow::anyhow!("Failed to read machine id: {}", e))?;
    Ok(sha256_hex(machine_id.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Random uuid generated on first run and persisted in the data dir.
fn stable_device_id() -> Result<String> {
    let path = device_id_path()?;
    if path.exists() {
        let id = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(id.trim().to_string());
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(id)
}

fn device_id_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
    Ok(data_dir.join(APP_NAME).join(DEVICE_ID_FILE))
}

fn os_release() -> String {
    if cfg!(target_os = "macos") {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    } else if cfg!(target_os = "windows") {
        std::env::var("OS").unwrap_or_else(|_| "Windows".to_string())
    } else {
        // Read the distro name from /etc/os-release
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|line| line.starts_with("PRETTY_NAME="))
                    .map(|line| {
                        line.split('=')
                            .nth(1)
                            .unwrap_or(UNKNOWN)
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "Linux".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_hex_and_stable() {
        let a = sha256_hex(b"machine");
        let b = sha256_hex(b"machine");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_collect_never_panics_and_fills_fallbacks() {
        let info = DeviceInfo::collect();
        assert!(!info.platform.is_empty());
        assert!(!info.device_fingerprint.is_empty());
        assert!(!info.device_id.is_empty());
    }

    #[test]
    fn test_serializes_flat_object() {
        let info = DeviceInfo::collect();
        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("device_fingerprint").is_some());
        assert!(value.get("hostname").is_some());
    }
}
