//! Error types for the licensing engine.

use thiserror::Error;

/// Licensing-specific errors.
///
/// The enum is `Clone` so that one single-flight result can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LicenseError {
    /// Malformed license key, rejected before any network call.
    #[error("invalid license key format: {0}")]
    InvalidFormat(String),

    /// The licensing authority could not be reached.
    #[error("licensing authority unreachable: {0}")]
    NetworkUnavailable(String),

    /// The authority explicitly rejected the key.
    #[error("license rejected by authority: {0}")]
    Rejected(String),

    /// Signature verification failed for a remote or cached payload.
    #[error("license payload signature invalid")]
    SignatureInvalid,

    /// The payload's own freshness window has elapsed.
    #[error("license payload no longer fresh: {0}")]
    PayloadExpired(String),

    /// Payload decoded but its contents are unusable.
    #[error("invalid license payload: {0}")]
    InvalidPayload(String),

    /// All activation slots are taken by other devices.
    #[error("activation limit exceeded (max {max} devices)")]
    ActivationLimitExceeded { max: u32 },

    /// A new device cannot be activated without contacting the authority.
    #[error("activating this device requires a connection to the licensing authority")]
    ActivationRequiresNetwork,

    /// License has expired.
    #[error("license expired on {0}")]
    Expired(String),

    /// No license has been activated on this installation.
    #[error("license not activated")]
    NotActivated,

    /// Caller lacks the privilege required for the operation.
    #[error("operation requires a privileged caller")]
    Unauthorized,

    /// The caller stopped waiting for an in-flight operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a failure, for rendering a tagged result at the
/// transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Client-side input problem; retrying the same input cannot succeed.
    Validation,
    /// Authority unreachable; retry later.
    Network,
    /// Authority or signature said no.
    Rejection,
    /// Licensing business rule (activation slots, expiry, caller privilege).
    Business,
    /// Local storage, serialization or configuration failure.
    Internal,
}

impl LicenseError {
    /// Returns the failure class of this error.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidFormat(_) => FailureClass::Validation,
            Self::NetworkUnavailable(_) | Self::ActivationRequiresNetwork => FailureClass::Network,
            Self::Rejected(_)
            | Self::SignatureInvalid
            | Self::PayloadExpired(_)
            | Self::InvalidPayload(_) => FailureClass::Rejection,
            Self::ActivationLimitExceeded { .. }
            | Self::Expired(_)
            | Self::NotActivated
            | Self::Unauthorized
            | Self::Cancelled => FailureClass::Business,
            Self::Storage(_) | Self::Serialization(_) | Self::Config(_) => FailureClass::Internal,
        }
    }

    /// Returns true if the scheduler should try again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_))
    }
}

impl From<serde_json::Error> for LicenseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for LicenseError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
