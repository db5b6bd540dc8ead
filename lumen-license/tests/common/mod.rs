//! Shared test helpers for license tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use lumen_license::{
    Clock, Ed25519Verifier, LicenseAuthority, LicenseCache, LicenseClaims, LicenseConfig, LicenseEngine,
    LicenseError, LicenseResult, ManualClock, SignedPayload,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const KEY: &str = "ABCD-1234-EFGH";

/// Returns a deterministic Ed25519 key pair from a fixed seed.
pub fn test_keypair() -> (SigningKey, [u8; 32]) {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key.to_bytes())
}

/// A second key pair the engine does not trust.
pub fn rogue_keypair() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn verifier() -> Arc<Ed25519Verifier> {
    let (_, pk) = test_keypair();
    Arc::new(Ed25519Verifier::from_bytes(&pk).unwrap())
}

/// 2026-01-01T00:00:00Z
pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap()
}

/// Claims for `KEY` issued at `at`, fresh for a week.
pub fn claims_at(at: DateTime<Utc>) -> LicenseClaims {
    LicenseClaims {
        license_key: KEY.to_string(),
        customer_id: Some("cus_42".to_string()),
        customer_name: Some("Acme Analytics".to_string()),
        product: Some("Lumen".to_string()),
        product_id: Some("prod_lumen".to_string()),
        features: BTreeSet::from(["export".to_string(), "sso".to_string()]),
        expires_at: None,
        activations: 0,
        max_activations: 2,
        device_id: None,
        iat: at.timestamp(),
        fresh_until: (at + Duration::days(7)).timestamp(),
    }
}

/// Signs claims: `base64url(claims_json).base64url(signature)`, signature over
/// the encoded claims string.
pub fn sign_claims(signing_key: &SigningKey, claims: &LicenseClaims) -> SignedPayload {
    let json = serde_json::to_string(claims).unwrap();
    sign_json(signing_key, &json)
}

pub fn sign_json(signing_key: &SigningKey, json: &str) -> SignedPayload {
    let claims_b64 = URL_SAFE_NO_PAD.encode(json.as_bytes());
    let signature = signing_key.sign(claims_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    SignedPayload::new(format!("{claims_b64}.{sig_b64}"))
}

/// Flips the lowest bit of the first signature byte.
pub fn flip_signature_bit(payload: &SignedPayload) -> SignedPayload {
    let (claims_b64, sig_b64) = payload.as_str().split_once('.').unwrap();
    let mut sig = URL_SAFE_NO_PAD.decode(sig_b64).unwrap();
    sig[0] ^= 0x01;
    SignedPayload::new(format!("{claims_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// How the mock authority answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Online,
    Unreachable,
    Reject(String),
    TamperSignature,
}

/// In-process licensing authority. Tracks activated devices per key the way a
/// real authority would and counts calls.
pub struct MockAuthority {
    signing_key: SigningKey,
    clock: Arc<ManualClock>,
    max_activations: u32,
    expires_at: Mutex<Option<i64>>,
    issued_at: Mutex<Option<DateTime<Utc>>>,
    fresh_for: Mutex<Duration>,
    devices: Mutex<HashMap<String, Vec<String>>>,
    mode: Mutex<Mode>,
    delay: Mutex<Option<std::time::Duration>>,
    activate_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl MockAuthority {
    pub fn new(clock: Arc<ManualClock>, max_activations: u32) -> Self {
        Self {
            signing_key: test_keypair().0,
            clock,
            max_activations,
            expires_at: Mutex::new(None),
            issued_at: Mutex::new(None),
            fresh_for: Mutex::new(Duration::days(7)),
            devices: Mutex::new(HashMap::new()),
            mode: Mutex::new(Mode::Online),
            delay: Mutex::new(None),
            activate_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_expires_at(&self, at: Option<DateTime<Utc>>) {
        *self.expires_at.lock().unwrap() = at.map(|t| t.timestamp());
    }

    /// Pins the signed issue time; `None` follows the clock.
    pub fn set_issued_at(&self, at: Option<DateTime<Utc>>) {
        *self.issued_at.lock().unwrap() = at;
    }

    pub fn set_fresh_for(&self, fresh_for: Duration) {
        *self.fresh_for.lock().unwrap() = fresh_for;
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn activate_calls(&self) -> usize {
        self.activate_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// Devices holding a slot for `KEY`.
    pub fn activated_devices(&self) -> usize {
        self.devices.lock().unwrap().get(KEY).map_or(0, Vec::len)
    }

    async fn answer(&self, license_key: &str, device_id: &str, activate: bool) -> LicenseResult<SignedPayload> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            Mode::Unreachable => {
                return Err(LicenseError::NetworkUnavailable("connection refused".into()));
            }
            Mode::Reject(reason) => return Err(LicenseError::Rejected(reason)),
            Mode::Online | Mode::TamperSignature => {}
        }

        let issued_at = self.issued_at.lock().unwrap().unwrap_or_else(|| self.clock.now());
        let mut claims = claims_at(issued_at);
        claims.fresh_until = (issued_at + *self.fresh_for.lock().unwrap()).timestamp();
        claims.license_key = license_key.to_string();
        claims.max_activations = self.max_activations;
        claims.expires_at = *self.expires_at.lock().unwrap();
        {
            let mut all = self.devices.lock().unwrap();
            let devices = all.entry(license_key.to_string()).or_default();
            let known = devices.iter().any(|d| d == device_id);
            claims.activations = devices.len() as u32;
            claims.device_id = known.then(|| device_id.to_string());
            if activate && !known && devices.len() < self.max_activations as usize {
                devices.push(device_id.to_string());
            }
        }

        let payload = sign_claims(&self.signing_key, &claims);
        if mode == Mode::TamperSignature {
            return Ok(flip_signature_bit(&payload));
        }
        Ok(payload)
    }
}

#[async_trait]
impl LicenseAuthority for MockAuthority {
    async fn activate(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
        self.activate_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(license_key, device_id, true).await
    }

    async fn verify(&self, license_key: &str, device_id: &str) -> LicenseResult<SignedPayload> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(license_key, device_id, false).await
    }
}

/// Engine wired to a mock authority, an in-memory cache and a manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub authority: Arc<MockAuthority>,
    pub cache: Arc<LicenseCache>,
    pub engine: LicenseEngine,
}

impl Harness {
    pub fn new(max_activations: u32) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let authority = Arc::new(MockAuthority::new(Arc::clone(&clock), max_activations));
        Self::with_authority("dev-a", clock, authority)
    }

    /// A second installation sharing the same authority and clock.
    pub fn with_authority(device_id: &str, clock: Arc<ManualClock>, authority: Arc<MockAuthority>) -> Self {
        let cache = Arc::new(LicenseCache::open_in_memory().unwrap());
        let engine = engine_for(device_id, &authority, &cache, &clock);
        Self {
            clock,
            authority,
            cache,
            engine,
        }
    }

    /// Rebuilds the engine over the same cache, as after a process restart.
    pub fn restart(&self, device_id: &str) -> LicenseEngine {
        engine_for(device_id, &self.authority, &self.cache, &self.clock)
    }
}

pub fn engine_for(
    device_id: &str,
    authority: &Arc<MockAuthority>,
    cache: &Arc<LicenseCache>,
    clock: &Arc<ManualClock>,
) -> LicenseEngine {
    LicenseEngine::with_clock(
        &LicenseConfig::default(),
        device_id,
        Arc::clone(authority) as Arc<dyn LicenseAuthority>,
        verifier(),
        Arc::clone(cache),
        Arc::clone(clock) as Arc<dyn Clock>,
    )
    .unwrap()
}
