//! Licensing and activation for Lumen.
//!
//! This crate decides whether an installation is entitled to run:
//! - License key syntax checks before any network call
//! - Activation and re-verification against the licensing authority
//! - Ed25519-signed license payloads, re-verified on every trust decision
//! - Device binding and activation-slot accounting
//! - Offline grace when the authority is unreachable
//! - Background re-verification
//!
//! # Design Principles
//!
//! - **Signed bytes are the source of truth**: decoded fields are a projection;
//!   the cached payload is re-verified before it is trusted again
//! - **Degrade, don't fail**: an unreachable authority moves the license into
//!   `grace_offline`, then `locked`, never straight to `invalid`
//! - **Rejection is final**: an explicit rejection is never masked by the cache
//! - **Single-flight**: one authority call per key at a time, shared by all waiters
//!
//! # Example
//!
//! ```no_run
//! use lumen_license::{
//!     Caller, DeviceFingerprint, Ed25519Verifier, HttpAuthority, LicenseCache,
//!     LicenseConfig, LicenseEngine,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> lumen_license::LicenseResult<()> {
//! let config = LicenseConfig::from_file("license.json")?;
//! let engine = LicenseEngine::new(
//!     &config,
//!     DeviceFingerprint::generate().id(),
//!     Arc::new(HttpAuthority::from_config(&config)?),
//!     Arc::new(Ed25519Verifier::from_hex(&config.public_key_hex)?),
//!     Arc::new(LicenseCache::open(config.cache_path())?),
//! )?;
//!
//! let state = engine.activate_license_key(Caller::Privileged, "ABCD-1234-EFGH").await?;
//! assert!(state.is_entitled());
//! # Ok(())
//! # }
//! ```

mod activation;
mod authority;
mod cache;
mod clock;
mod config;
mod device;
mod engine;
mod error;
mod key;
mod payload;
mod record;
mod scheduler;

pub use activation::{Activation, ActivationTracker};
pub use authority::LicenseAuthority;
pub use cache::LicenseCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LicenseConfig, DEFAULT_OFFLINE_GRACE_SECS};
pub use device::{DeviceFingerprint, DeviceInfo};
pub use engine::{Caller, LicenseEngine};
pub use error::{FailureClass, LicenseError, LicenseResult};
pub use key::{check_char, KeyFormat, LicenseKeyValidator};
pub use payload::{
    Ed25519Verifier, LicenseClaims, SignatureVerifier, SignedPayload, SignedRecordVerifier,
    VerifiedPayload,
};
pub use record::{LicenseRecord, LicenseState, LicenseStatus};
pub use scheduler::{RevalidationScheduler, SchedulerHandle};

#[cfg(feature = "online")]
pub use authority::HttpAuthority;
