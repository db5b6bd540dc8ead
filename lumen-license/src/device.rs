//! Stable per-installation device identity.
//!
//! The engine only consumes a device id string; this module is the default
//! source of one. The id is a hash of host identifiers that survive reboots
//! (OS, architecture, hostname, machine id, user), so the same installation
//! reports the same id across restarts.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;

/// Descriptive information about the host, reported alongside activations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub os_name: String,
    pub os_version: String,
    pub hostname: String,
    pub arch: String,
}

impl DeviceInfo {
    /// Collects information about the current host.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os_name: env::consts::OS.to_string(),
            os_version: os_version(),
            hostname: hostname(),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// A device identifier derived from host identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    /// Fingerprints the current host.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_components(&host_components())
    }

    /// Fingerprints an explicit list of identifiers.
    #[must_use]
    pub fn from_components<S: AsRef<str>>(components: &[S]) -> Self {
        let mut hasher = Sha256::new();
        for (i, c) in components.iter().enumerate() {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(c.as_ref().as_bytes());
        }
        let digest = hasher.finalize();
        Self(format!("dev-{}", URL_SAFE_NO_PAD.encode(&digest[..16])))
    }

    /// Returns the device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Returns true if this fingerprint was generated on the current host.
    #[must_use]
    pub fn matches_current(&self) -> bool {
        *self == Self::generate()
    }
}

impl From<DeviceFingerprint> for String {
    fn from(fp: DeviceFingerprint) -> Self {
        fp.0
    }
}

fn host_components() -> Vec<String> {
    let mut ids = vec![
        env::consts::OS.to_string(),
        env::consts::ARCH.to_string(),
        hostname(),
    ];
    if let Some(machine_id) = machine_id() {
        ids.push(machine_id);
    }
    if let Ok(user) = env::var("USER").or_else(|_| env::var("USERNAME")) {
        ids.push(user);
    }
    ids
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "linux")]
fn os_version() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|content| {
            content
                .lines()
                .find_map(|l| l.strip_prefix("VERSION_ID="))
                .map(|v| v.trim_matches('"').to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_version() -> String {
    "unknown".to_string()
}

#[cfg(target_os = "linux")]
fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(target_os = "macos")]
fn machine_id() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8(output.stdout).ok()?;
    text.lines()
        .find(|l| l.contains("IOPlatformUUID"))
        .and_then(|l| l.split('"').nth(3))
        .map(String::from)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn machine_id() -> Option<String> {
    None
}
