//! Activation slot accounting and device binding.
//!
//! The authority reports, for the requesting device, how many slots are in
//! use and whether this device already holds one. The tracker turns that view
//! into the record this installation keeps, enforcing
//! `0 <= activations <= max_activations`.

use crate::error::{LicenseError, LicenseResult};
use crate::payload::VerifiedPayload;
use crate::record::LicenseRecord;

/// Result of applying an activation to a verified payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// Activation count after this request.
    pub activations: u32,
    pub max_activations: u32,
    /// The device now bound to this installation's slot.
    pub device_id: String,
    /// True if a new slot was consumed by this request.
    pub newly_bound: bool,
}

/// Enforces the activation and device-count invariant.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivationTracker;

impl ActivationTracker {
    /// Creates a tracker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Binds `device_id` against the authority's freshly verified view.
    ///
    /// Re-activation by the already bound device is idempotent; a new device
    /// consumes a slot if one is free.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::ActivationLimitExceeded`] when the device is not
    /// bound and every slot is taken.
    pub fn bind(&self, verified: &VerifiedPayload, device_id: &str) -> LicenseResult<Activation> {
        let claims = &verified.claims;

        if claims.device_id.as_deref() == Some(device_id) {
            return Ok(Activation {
                activations: claims.activations,
                max_activations: claims.max_activations,
                device_id: device_id.to_string(),
                newly_bound: false,
            });
        }

        if claims.activations >= claims.max_activations {
            return Err(LicenseError::ActivationLimitExceeded {
                max: claims.max_activations,
            });
        }

        Ok(Activation {
            activations: claims.activations + 1,
            max_activations: claims.max_activations,
            device_id: device_id.to_string(),
            newly_bound: true,
        })
    }

    /// Confirms during an online refresh that the authority still has this
    /// device bound.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Rejected`] if the authority reports another
    /// device, or none.
    pub fn confirm_online(&self, verified: &VerifiedPayload, device_id: &str) -> LicenseResult<()> {
        match verified.claims.device_id.as_deref() {
            Some(bound) if bound == device_id => Ok(()),
            Some(_) => Err(LicenseError::Rejected(
                "license is bound to a different device".to_string(),
            )),
            None => Err(LicenseError::Rejected(
                "device is not activated for this license".to_string(),
            )),
        }
    }

    /// Confirms without authority contact that `device_id` is the device this
    /// installation was bound to. The signed claims, when they name a device,
    /// must agree.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::ActivationRequiresNetwork`] if the device differs.
    pub fn confirm_offline(
        &self,
        record: &LicenseRecord,
        verified: &VerifiedPayload,
        device_id: &str,
    ) -> LicenseResult<()> {
        let bound_matches = record.device_id.as_deref() == Some(device_id);
        let signed_matches = verified
            .claims
            .device_id
            .as_deref()
            .is_none_or(|signed| signed == device_id);

        if bound_matches && signed_matches {
            Ok(())
        } else {
            Err(LicenseError::ActivationRequiresNetwork)
        }
    }
}
