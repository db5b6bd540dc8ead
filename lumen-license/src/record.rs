//! The license record and the state snapshot exposed to callers.

use crate::payload::SignedPayload;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Externally observable license status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    /// No successful check yet.
    #[default]
    Unknown,
    /// Confirmed by the authority.
    Valid,
    /// Rejected by the authority, or a payload failed signature verification.
    Invalid,
    /// `expires_at` has passed.
    Expired,
    /// Authority unreachable; cached payload still trusted within the grace window.
    GraceOffline,
    /// Grace window exceeded without re-verification; reconnect required.
    Locked,
}

impl LicenseStatus {
    /// Returns true if the installation may run with its licensed features.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Valid | Self::GraceOffline)
    }

    /// Returns the canonical lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::GraceOffline => "grace_offline",
            Self::Locked => "locked",
        }
    }
}

impl fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "expired" => Ok(Self::Expired),
            "grace_offline" => Ok(Self::GraceOffline),
            "locked" => Ok(Self::Locked),
            other => Err(format!("unknown license status: {other}")),
        }
    }
}

/// The authoritative license fact for this installation.
///
/// Decoded fields are a projection of `cached_response` kept for queries.
/// Trust decisions always re-verify `cached_response` itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_key: String,
    pub status: LicenseStatus,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub product: Option<String>,
    pub product_id: Option<String>,
    pub features: BTreeSet<String>,
    /// Absent means perpetual.
    pub expires_at: Option<DateTime<Utc>>,
    /// Last successful contact with the authority.
    pub verified_at: Option<DateTime<Utc>>,
    /// Issue time of `cached_response`.
    pub issued_at: Option<DateTime<Utc>>,
    pub activations: u32,
    pub max_activations: u32,
    /// Device bound at first successful activation.
    pub device_id: Option<String>,
    pub is_offline: bool,
    /// The last signed payload, stored verbatim.
    pub cached_response: Option<SignedPayload>,
}

impl LicenseRecord {
    /// The empty record of a fresh installation.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if a key has been activated.
    #[must_use]
    pub fn is_activated(&self) -> bool {
        !self.license_key.is_empty()
    }

    /// Returns true if `expires_at` is at or before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Start of the offline grace window: the last authority contact, never
    /// later than the signed issue time plus `clock_skew`. The contact time
    /// is unsigned, so it can only pull the anchor earlier.
    #[must_use]
    pub fn grace_anchor(&self, clock_skew: Duration) -> Option<DateTime<Utc>> {
        match (self.verified_at, self.issued_at) {
            (Some(contact), Some(issued)) => Some(contact.min(issued + clock_skew)),
            (contact, issued) => contact.or(issued),
        }
    }
}

/// Snapshot of the license returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseState {
    pub status: LicenseStatus,
    pub license_key: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub product: Option<String>,
    pub product_id: Option<String>,
    pub features: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub activations: u32,
    pub max_activations: u32,
    pub device_id: Option<String>,
    pub is_offline: bool,
    /// Seconds left in the offline grace window; only set in `grace_offline`.
    pub grace_remaining_secs: Option<i64>,
}

impl LicenseState {
    /// Builds the snapshot for `record` at `now`. `grace_ends_at` is the end
    /// of the offline grace window, if one applies.
    #[must_use]
    pub fn from_record(record: &LicenseRecord, now: DateTime<Utc>, grace_ends_at: Option<DateTime<Utc>>) -> Self {
        let grace_remaining_secs = match (record.status, grace_ends_at) {
            (LicenseStatus::GraceOffline, Some(ends)) => Some((ends - now).num_seconds().max(0)),
            _ => None,
        };

        Self {
            status: record.status,
            license_key: record.is_activated().then(|| record.license_key.clone()),
            customer_id: record.customer_id.clone(),
            customer_name: record.customer_name.clone(),
            product: record.product.clone(),
            product_id: record.product_id.clone(),
            features: record.features.clone(),
            expires_at: record.expires_at,
            verified_at: record.verified_at,
            activations: record.activations,
            max_activations: record.max_activations,
            device_id: record.device_id.clone(),
            is_offline: record.is_offline,
            grace_remaining_secs,
        }
    }

    /// Returns true if the installation may run (valid or in offline grace).
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        self.status.is_entitled()
    }

    /// Returns true if the caller should be told to reconnect rather than
    /// that the license is invalid.
    #[must_use]
    pub fn requires_reconnect(&self) -> bool {
        self.status == LicenseStatus::Locked
    }

    /// Returns true if the license is entitled and grants `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.is_entitled() && self.features.contains(feature)
    }
}
