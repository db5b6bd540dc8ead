//! Engine configuration.

use crate::error::{LicenseError, LicenseResult};
use crate::key::KeyFormat;
use crate::payload::Ed25519Verifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default offline grace window: 72 hours since the last successful contact.
pub const DEFAULT_OFFLINE_GRACE_SECS: u64 = 72 * 60 * 60;

/// Configuration for the license engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// Base URL of the licensing authority.
    pub authority_url: String,
    /// Hex-encoded Ed25519 key the authority signs payloads with.
    pub public_key_hex: String,
    /// Timeout for one authority request (ms).
    pub request_timeout_ms: u64,
    /// Extra attempts after a network failure.
    pub max_retries: u32,
    /// Backoff unit between attempts (ms); attempt `n` waits `n` units.
    pub retry_backoff_ms: u64,
    /// How long a cached payload is trusted without authority contact (s).
    pub offline_grace_secs: u64,
    /// How far in the future a payload's issued-at may lie (s).
    pub clock_skew_secs: u64,
    /// Interval between background re-verifications (s).
    pub revalidation_interval_secs: u64,
    /// Interval between re-verifications while the authority is unreachable (s).
    pub offline_retry_interval_secs: u64,
    /// Whether license keys carry a trailing check character.
    pub require_checksum: bool,
    /// Location of the license cache database.
    pub cache_path: Option<PathBuf>,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            authority_url: "https://license.lumen.dev".to_string(),
            public_key_hex: String::new(),
            request_timeout_ms: 5_000,
            max_retries: 2,
            retry_backoff_ms: 250,
            offline_grace_secs: DEFAULT_OFFLINE_GRACE_SECS,
            clock_skew_secs: 300,
            revalidation_interval_secs: 6 * 60 * 60,
            offline_retry_interval_secs: 5 * 60,
            require_checksum: false,
            cache_path: None,
        }
    }
}

impl LicenseConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> LicenseResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LicenseError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| LicenseError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.authority_url.trim().is_empty() {
            return Err(LicenseError::Config("authority_url is empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(LicenseError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.offline_grace_secs == 0 {
            return Err(LicenseError::Config("offline_grace_secs must be positive".to_string()));
        }
        if self.revalidation_interval_secs == 0 || self.offline_retry_interval_secs == 0 {
            return Err(LicenseError::Config(
                "revalidation intervals must be positive".to_string(),
            ));
        }
        Ed25519Verifier::from_hex(&self.public_key_hex)?;
        Ok(())
    }

    /// Returns the cache path, falling back to the platform data directory.
    pub fn cache_path(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lumen")
                .join("license.db")
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn offline_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_grace_secs as i64)
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs as i64)
    }

    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_secs)
    }

    pub fn offline_retry_interval(&self) -> Duration {
        Duration::from_secs(self.offline_retry_interval_secs)
    }

    pub fn key_format(&self) -> KeyFormat {
        KeyFormat {
            require_checksum: self.require_checksum,
        }
    }
}
