//! Signed license payloads and their verification.
//!
//! A payload has the format: `base64url(claims).base64url(signature)`
//!
//! The claims are a JSON object describing the license as the authority sees
//! it for the requesting device (see [`LicenseClaims`]). The signature covers
//! `claims_b64.as_bytes()` (the base64url-encoded claims string, not the
//! decoded JSON).
//!
//! The same [`SignedRecordVerifier`] checks live authority responses and the
//! copy replayed from the local cache.

use crate::error::{LicenseError, LicenseResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Signed payload bytes exactly as received from the authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedPayload(String);

impl SignedPayload {
    /// Wraps a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SignedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedPayload({} bytes)", self.0.len())
    }
}

/// License facts signed by the authority (matches the authority's JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseClaims {
    pub license_key: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    /// License expiry (seconds since epoch), absent for perpetual licenses.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub activations: u32,
    pub max_activations: u32,
    /// Device the authority already has bound for this request, if any.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Issued-at (seconds since epoch).
    pub iat: i64,
    /// End of the payload's freshness window (seconds since epoch).
    pub fresh_until: i64,
}

/// A payload whose signature and freshness have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayload {
    pub claims: LicenseClaims,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub fresh_until: DateTime<Utc>,
    /// The original bytes, kept for the cache.
    pub payload: SignedPayload,
}

/// Public-key signature check, injected into the verifier.
pub trait SignatureVerifier: Send + Sync {
    /// Returns true if `signature` is a valid signature of `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 implementation of [`SignatureVerifier`].
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Builds a verifier from a raw 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the bytes are not a valid point.
    pub fn from_bytes(bytes: &[u8; 32]) -> LicenseResult<Self> {
        let key = VerifyingKey::from_bytes(bytes)
            .map_err(|_| LicenseError::Config("invalid public key".to_string()))?;
        Ok(Self { key })
    }

    /// Builds a verifier from a hex-encoded 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] on bad hex, wrong length or an invalid key.
    pub fn from_hex(hex_key: &str) -> LicenseResult<Self> {
        let raw = hex::decode(hex_key.trim())
            .map_err(|e| LicenseError::Config(format!("invalid public key hex: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| LicenseError::Config("public key must be 32 bytes".to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.key.verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// Checks authenticity and freshness of signed payloads. Pure, no I/O.
#[derive(Clone)]
pub struct SignedRecordVerifier {
    signature: Arc<dyn SignatureVerifier>,
    clock_skew: Duration,
}

impl SignedRecordVerifier {
    /// Creates a verifier. `clock_skew` bounds how far in the future an
    /// issued-at time may lie.
    pub fn new(signature: Arc<dyn SignatureVerifier>, clock_skew: Duration) -> Self {
        Self {
            signature,
            clock_skew,
        }
    }

    /// Verifies `payload` at time `now` and decodes its claims.
    ///
    /// # Errors
    ///
    /// - [`LicenseError::SignatureInvalid`] if the token is malformed or the
    ///   signature does not verify.
    /// - [`LicenseError::InvalidPayload`] if signed claims cannot be decoded or
    ///   break the activation invariant.
    /// - [`LicenseError::PayloadExpired`] if the freshness window has elapsed
    ///   or the payload claims to be issued in the future.
    pub fn verify(&self, payload: &SignedPayload, now: DateTime<Utc>) -> LicenseResult<VerifiedPayload> {
        let verified = self.authenticate(payload)?;
        self.check_issued(&verified, now)?;
        if now > verified.fresh_until {
            return Err(LicenseError::PayloadExpired(format!(
                "freshness window ended at {}",
                verified.fresh_until
            )));
        }
        Ok(verified)
    }

    /// Checks the signature and decodes the claims without looking at the
    /// time. Callers decide which time bounds apply.
    ///
    /// # Errors
    ///
    /// [`LicenseError::SignatureInvalid`] or [`LicenseError::InvalidPayload`],
    /// as for [`verify`](Self::verify).
    pub fn authenticate(&self, payload: &SignedPayload) -> LicenseResult<VerifiedPayload> {
        let (claims_b64, signature_b64) = payload
            .as_str()
            .split_once('.')
            .ok_or(LicenseError::SignatureInvalid)?;
        if signature_b64.contains('.') {
            return Err(LicenseError::SignatureInvalid);
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| LicenseError::SignatureInvalid)?;

        if !self.signature.verify(claims_b64.as_bytes(), &sig_bytes) {
            return Err(LicenseError::SignatureInvalid);
        }

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| LicenseError::InvalidPayload(format!("invalid claims base64: {e}")))?;
        let claims: LicenseClaims = serde_json::from_slice(&claims_json)
            .map_err(|e| LicenseError::InvalidPayload(format!("invalid claims JSON: {e}")))?;

        if claims.license_key.trim().is_empty() {
            return Err(LicenseError::InvalidPayload("missing license key".to_string()));
        }
        if claims.activations > claims.max_activations {
            return Err(LicenseError::InvalidPayload(format!(
                "activations {} exceed maximum {}",
                claims.activations, claims.max_activations
            )));
        }

        let issued_at = timestamp(claims.iat, "iat")?;
        let fresh_until = timestamp(claims.fresh_until, "fresh_until")?;
        let expires_at = claims
            .expires_at
            .map(|secs| timestamp(secs, "expires_at"))
            .transpose()?;

        Ok(VerifiedPayload {
            claims,
            expires_at,
            issued_at,
            fresh_until,
            payload: payload.clone(),
        })
    }

    /// Rejects payloads issued further in the future than the clock skew allows.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::PayloadExpired`].
    pub fn check_issued(&self, verified: &VerifiedPayload, now: DateTime<Utc>) -> LicenseResult<()> {
        if verified.issued_at > now + self.clock_skew {
            return Err(LicenseError::PayloadExpired(format!(
                "issued in the future ({})",
                verified.issued_at
            )));
        }
        Ok(())
    }
}

fn timestamp(secs: i64, field: &str) -> LicenseResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| LicenseError::InvalidPayload(format!("{field} out of range")))
}
