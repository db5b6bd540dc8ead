//! License state machine.
//!
//! The engine owns the in-memory working copy of the license record and is
//! the only place where license state changes. Every change flows through
//! [`LicenseEngine::activate`] or [`LicenseEngine::refresh`]:
//!
//! ```text
//! activate: validate key -> authority.activate -> verify -> bind  -> cache.store
//! refresh:                  authority.verify   -> verify -> confirm -> cache.store
//!                           \-- unreachable --> re-verify cached payload -> grace_offline | locked
//! ```
//!
//! Operations are single-flight per license key. Each flight runs on its own
//! task, so a caller that stops waiting never aborts an authority call that is
//! already under way.

use crate::activation::ActivationTracker;
use crate::authority::LicenseAuthority;
use crate::cache::LicenseCache;
use crate::clock::{Clock, SystemClock};
use crate::config::LicenseConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::key::LicenseKeyValidator;
use crate::payload::{SignatureVerifier, SignedRecordVerifier, VerifiedPayload};
use crate::record::{LicenseRecord, LicenseState, LicenseStatus};
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Who is invoking a privileged operation. The transport layer decides;
/// the engine only checks the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// An administrator allowed to change licensing state.
    Privileged,
    /// Anyone else.
    Anonymous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Activate,
    Refresh,
}

type FlightResult = Shared<BoxFuture<'static, LicenseResult<LicenseState>>>;

struct Flight {
    id: u64,
    kind: FlightKind,
    result: FlightResult,
}

/// The license engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LicenseEngine {
    inner: Arc<Inner>,
}

struct Inner {
    device_id: String,
    grace: Duration,
    clock_skew: Duration,
    validator: LicenseKeyValidator,
    verifier: SignedRecordVerifier,
    tracker: ActivationTracker,
    authority: Arc<dyn LicenseAuthority>,
    cache: Arc<LicenseCache>,
    clock: Arc<dyn Clock>,
    working: RwLock<LicenseRecord>,
    flights: Mutex<HashMap<String, Flight>>,
    next_flight: AtomicU64,
}

impl LicenseEngine {
    /// Creates an engine on the system clock.
    ///
    /// The cached record is loaded and evaluated without network access, so
    /// [`get_status`](Self::get_status) is meaningful immediately.
    pub fn new(
        config: &LicenseConfig,
        device_id: impl Into<String>,
        authority: Arc<dyn LicenseAuthority>,
        signature: Arc<dyn SignatureVerifier>,
        cache: Arc<LicenseCache>,
    ) -> LicenseResult<Self> {
        Self::with_clock(
            config,
            device_id,
            authority,
            signature,
            cache,
            Arc::new(SystemClock::new()),
        )
    }

    /// Creates an engine with a custom clock.
    pub fn with_clock(
        config: &LicenseConfig,
        device_id: impl Into<String>,
        authority: Arc<dyn LicenseAuthority>,
        signature: Arc<dyn SignatureVerifier>,
        cache: Arc<LicenseCache>,
        clock: Arc<dyn Clock>,
    ) -> LicenseResult<Self> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(LicenseError::Config("device id is empty".to_string()));
        }

        let mut inner = Inner {
            device_id,
            grace: config.offline_grace(),
            clock_skew: config.clock_skew(),
            validator: LicenseKeyValidator::new(config.key_format()),
            verifier: SignedRecordVerifier::new(signature, config.clock_skew()),
            tracker: ActivationTracker::new(),
            authority,
            cache,
            clock,
            working: RwLock::new(LicenseRecord::empty()),
            flights: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        };

        let record = inner.startup_record()?;
        inner.working = RwLock::new(record);
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Returns the device id this engine activates for.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Returns the offline grace window.
    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Returns true if a license key has been activated on this installation.
    pub async fn is_activated(&self) -> bool {
        self.inner.working.read().await.is_activated()
    }

    /// Current license state. Never fails and never touches the network.
    ///
    /// Time-based downgrades (expiry, grace exhaustion) are applied to the
    /// snapshot even if no refresh has run since they became due.
    pub async fn get_status(&self) -> LicenseState {
        let record = self.inner.working.read().await;
        self.inner.project(&record, self.inner.clock.now())
    }

    /// Privileged activation entry point.
    pub async fn activate_license_key(&self, caller: Caller, raw_key: &str) -> LicenseResult<LicenseState> {
        if caller != Caller::Privileged {
            return Err(LicenseError::Unauthorized);
        }
        self.activate(raw_key).await
    }

    /// Privileged forced refresh.
    pub async fn check_license(&self, caller: Caller) -> LicenseResult<LicenseState> {
        if caller != Caller::Privileged {
            return Err(LicenseError::Unauthorized);
        }
        self.refresh().await
    }

    /// Activates `raw_key` for this device.
    ///
    /// On failure the prior state is left untouched, except that an
    /// authoritative rejection of the currently held key marks it invalid.
    pub async fn activate(&self, raw_key: &str) -> LicenseResult<LicenseState> {
        let key = self.inner.validator.validate(raw_key)?;
        self.inner.run_flight(key, FlightKind::Activate).await
    }

    /// Re-verifies the current license with the authority, degrading to the
    /// offline path when it is unreachable.
    ///
    /// An unreachable authority still returns
    /// [`LicenseError::NetworkUnavailable`] after the state has been degraded,
    /// so privileged callers can tell the user.
    pub async fn refresh(&self) -> LicenseResult<LicenseState> {
        let key = {
            let record = self.inner.working.read().await;
            if !record.is_activated() {
                return Err(LicenseError::NotActivated);
            }
            record.license_key.clone()
        };
        self.inner.run_flight(key, FlightKind::Refresh).await
    }

    /// Like [`activate`](Self::activate), but gives up with
    /// [`LicenseError::Cancelled`] when `cancel` completes first. The
    /// underlying activation keeps running and still commits.
    pub async fn activate_until<F>(&self, raw_key: &str, cancel: F) -> LicenseResult<LicenseState>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.activate(raw_key) => result,
            () = cancel => Err(LicenseError::Cancelled),
        }
    }

    /// Like [`refresh`](Self::refresh), but gives up with
    /// [`LicenseError::Cancelled`] when `cancel` completes first.
    pub async fn refresh_until<F>(&self, cancel: F) -> LicenseResult<LicenseState>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.refresh() => result,
            () = cancel => Err(LicenseError::Cancelled),
        }
    }
}

impl Inner {
    // ── Startup ──────────────────────────────────────────────────

    fn startup_record(&self) -> LicenseResult<LicenseRecord> {
        let Some(stored) = self.cache.load()? else {
            return Ok(LicenseRecord::empty());
        };
        if !stored.is_activated() {
            return Ok(stored);
        }

        let now = self.clock.now();
        let mut record = stored.clone();
        let outcome = self.evaluate_cached(&mut record, now, stored.is_offline);
        record.status = match outcome {
            Ok(status) => status,
            Err(e) => {
                warn!("Cached license failed verification at startup: {}", e);
                LicenseStatus::Invalid
            }
        };

        if record != stored {
            if record.status != stored.status {
                info!("License status at startup: {} -> {}", stored.status, record.status);
            }
            self.cache.store(&record)?;
        }
        Ok(record)
    }

    // ── Single-flight gate ───────────────────────────────────────

    async fn run_flight(self: &Arc<Self>, key: String, kind: FlightKind) -> LicenseResult<LicenseState> {
        loop {
            let (result, joined) = {
                let mut flights = self
                    .flights
                    .lock()
                    .map_err(|_| LicenseError::Storage("flight table poisoned".to_string()))?;
                match flights.get(&key) {
                    Some(flight) => (flight.result.clone(), flight.kind == kind),
                    None => {
                        let result = self.start_flight(&mut flights, &key, kind);
                        (result, true)
                    }
                }
            };

            if joined {
                return result.await;
            }
            // Another kind of operation holds this key; wait it out, then start ours.
            debug!("Waiting for in-flight license operation on {}", key);
            let _ = result.await;
        }
    }

    fn start_flight(
        self: &Arc<Self>,
        flights: &mut HashMap<String, Flight>,
        key: &str,
        kind: FlightKind,
    ) -> FlightResult {
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let task_key = key.to_string();

        let handle = tokio::spawn(async move {
            let result = match kind {
                FlightKind::Activate => inner.activate_pipeline(&task_key).await,
                FlightKind::Refresh => inner.refresh_pipeline(&task_key).await,
            };
            inner.finish_flight(&task_key, id);
            result
        });

        let result = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(LicenseError::Storage(format!("license task failed: {e}"))))
        }
        .boxed()
        .shared();

        flights.insert(
            key.to_string(),
            Flight {
                id,
                kind,
                result: result.clone(),
            },
        );
        result
    }

    fn finish_flight(&self, key: &str, id: u64) {
        let mut flights = match self.flights.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if flights.get(key).is_some_and(|f| f.id == id) {
            flights.remove(key);
        }
    }

    // ── Pipelines ────────────────────────────────────────────────

    async fn activate_pipeline(&self, key: &str) -> LicenseResult<LicenseState> {
        let current = self.working.read().await.clone();
        let same_key = current.license_key == key;

        let payload = match self.authority.activate(key, &self.device_id).await {
            Ok(payload) => payload,
            Err(LicenseError::NetworkUnavailable(reason)) => {
                if same_key && current.device_id.as_deref() == Some(self.device_id.as_str()) {
                    info!("Authority unreachable ({}); re-confirming activation offline", reason);
                    self.degrade_offline(key).await?;
                    let state = self.state().await;
                    if state.is_entitled() {
                        return Ok(state);
                    }
                    warn!("Offline re-activation left the license {}", state.status);
                    return Err(LicenseError::NetworkUnavailable(reason));
                }
                warn!("Cannot activate without the authority: {}", reason);
                return Err(LicenseError::ActivationRequiresNetwork);
            }
            Err(LicenseError::Rejected(reason)) => {
                if same_key {
                    self.mark_invalid(key).await?;
                }
                warn!("Activation rejected: {}", reason);
                return Err(LicenseError::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let verified = match self.verifier.verify(&payload, now) {
            Ok(verified) => verified,
            Err(LicenseError::SignatureInvalid) => {
                if same_key {
                    self.mark_invalid(key).await?;
                }
                warn!("Activation response failed signature verification");
                return Err(LicenseError::SignatureInvalid);
            }
            Err(e) => return Err(e),
        };
        ensure_key(&verified, key)?;

        let activation = self.tracker.bind(&verified, &self.device_id)?;
        let record = build_record(&verified, activation.activations, activation.device_id, now);
        info!(
            "License activated ({}/{} devices{})",
            record.activations,
            record.max_activations,
            if activation.newly_bound { ", new device" } else { "" }
        );
        self.commit(key, record, true).await
    }

    async fn refresh_pipeline(&self, key: &str) -> LicenseResult<LicenseState> {
        let payload = match self.authority.verify(key, &self.device_id).await {
            Ok(payload) => payload,
            Err(LicenseError::NetworkUnavailable(reason)) => {
                warn!("Authority unreachable during refresh: {}", reason);
                self.degrade_offline(key).await?;
                return Err(LicenseError::NetworkUnavailable(reason));
            }
            Err(LicenseError::Rejected(reason)) => {
                warn!("License rejected on refresh: {}", reason);
                self.mark_invalid(key).await?;
                return Err(LicenseError::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        let verified = match self.verifier.verify(&payload, now) {
            Ok(verified) => verified,
            Err(LicenseError::SignatureInvalid) => {
                warn!("Refresh response failed signature verification");
                self.mark_invalid(key).await?;
                return Err(LicenseError::SignatureInvalid);
            }
            Err(e) => return Err(e),
        };
        ensure_key(&verified, key)?;

        if let Err(e) = self.tracker.confirm_online(&verified, &self.device_id) {
            self.mark_invalid(key).await?;
            return Err(e);
        }

        let record = build_record(
            &verified,
            verified.claims.activations,
            self.device_id.clone(),
            now,
        );
        debug!("License refreshed: {}", record.status);
        self.commit(key, record, false).await
    }

    // ── Commit points ────────────────────────────────────────────

    /// Stores `record` and makes it the working copy. A refresh whose key was
    /// replaced by an activation in the meantime is discarded.
    async fn commit(&self, key: &str, record: LicenseRecord, allow_switch: bool) -> LicenseResult<LicenseState> {
        let mut working = self.working.write().await;
        if !allow_switch && working.license_key != key {
            debug!("Discarding refresh result for superseded key");
            return Ok(self.project(&working, self.clock.now()));
        }
        if working.license_key != key && working.is_activated() {
            info!("Switching license key; previous record replaced");
        }
        self.cache.store(&record)?;
        let previous = std::mem::replace(&mut *working, record);
        if previous.status != working.status {
            info!("License status: {} -> {}", previous.status, working.status);
        }
        Ok(self.project(&working, self.clock.now()))
    }

    async fn mark_invalid(&self, key: &str) -> LicenseResult<()> {
        let mut working = self.working.write().await;
        if working.license_key != key || working.status == LicenseStatus::Invalid {
            return Ok(());
        }
        let mut record = working.clone();
        record.status = LicenseStatus::Invalid;
        self.cache.store(&record)?;
        info!("License status: {} -> {}", working.status, record.status);
        *working = record;
        Ok(())
    }

    /// Re-evaluates the persisted record for the offline path. Returns the
    /// trust failure, if any, after recording `invalid`.
    async fn degrade_offline(&self, key: &str) -> LicenseResult<()> {
        let mut working = self.working.write().await;
        if working.license_key != key {
            return Ok(());
        }

        let now = self.clock.now();
        let mut record = match self.cache.load()? {
            Some(stored) if stored.license_key == key => stored,
            _ => working.clone(),
        };
        if working.status == LicenseStatus::Invalid {
            record.status = LicenseStatus::Invalid;
        }
        let outcome = self.evaluate_cached(&mut record, now, true);
        record.status = match &outcome {
            Ok(status) => *status,
            Err(_) => LicenseStatus::Invalid,
        };
        record.is_offline = true;

        if record != *working {
            self.cache.store(&record)?;
            if record.status != working.status {
                info!("License status (offline): {} -> {}", working.status, record.status);
            }
            *working = record;
        }
        outcome.map(|_| ())
    }

    // ── Evaluation ───────────────────────────────────────────────

    /// Derives the status of a cached record from its signed bytes alone.
    /// Never upgrades a record already marked invalid. Backfills
    /// `issued_at` from the payload so later reads share the same anchor.
    ///
    /// The payload's own freshness window is not consulted here: offline
    /// use is bounded by the grace period alone.
    fn evaluate_cached(&self, record: &mut LicenseRecord, now: DateTime<Utc>, offline: bool) -> LicenseResult<LicenseStatus> {
        if record.status == LicenseStatus::Invalid {
            return Ok(LicenseStatus::Invalid);
        }

        let payload = record
            .cached_response
            .as_ref()
            .ok_or(LicenseError::SignatureInvalid)?;
        let verified = self.verifier.authenticate(payload)?;
        ensure_key(&verified, &record.license_key)?;
        self.tracker.confirm_offline(record, &verified, &self.device_id)?;
        record.issued_at = Some(verified.issued_at);

        if verified.expires_at.is_some_and(|exp| exp <= now) {
            return Ok(LicenseStatus::Expired);
        }
        if let Err(e) = self.verifier.check_issued(&verified, now) {
            debug!("Cached payload not usable offline: {}", e);
            return Ok(LicenseStatus::Locked);
        }

        match self.grace_deadline(record) {
            Some(deadline) if now <= deadline => Ok(if offline {
                LicenseStatus::GraceOffline
            } else {
                LicenseStatus::Valid
            }),
            _ => Ok(LicenseStatus::Locked),
        }
    }

    /// Last instant a record may stay entitled without contacting the
    /// authority.
    fn grace_deadline(&self, record: &LicenseRecord) -> Option<DateTime<Utc>> {
        record.grace_anchor(self.clock_skew).map(|anchor| anchor + self.grace)
    }

    /// Snapshot of `record` at `now` with time-based downgrades applied.
    /// Expiry outranks a lock.
    fn project(&self, record: &LicenseRecord, now: DateTime<Utc>) -> LicenseState {
        let mut view = record.clone();
        let deadline = self.grace_deadline(&view);
        let downgradable = view.status.is_entitled() || view.status == LicenseStatus::Locked;
        if downgradable && view.is_expired_at(now) {
            view.status = LicenseStatus::Expired;
        } else if view.status.is_entitled() && deadline.is_some_and(|d| now > d) {
            view.status = LicenseStatus::Locked;
        }
        LicenseState::from_record(&view, now, deadline)
    }

    async fn state(&self) -> LicenseState {
        let record = self.working.read().await;
        self.project(&record, self.clock.now())
    }
}

fn ensure_key(verified: &VerifiedPayload, key: &str) -> LicenseResult<()> {
    if verified.claims.license_key == key {
        Ok(())
    } else {
        Err(LicenseError::InvalidPayload(
            "payload was issued for a different license key".to_string(),
        ))
    }
}

fn build_record(verified: &VerifiedPayload, activations: u32, device_id: String, now: DateTime<Utc>) -> LicenseRecord {
    let claims = &verified.claims;
    let status = if verified.expires_at.is_some_and(|exp| exp <= now) {
        LicenseStatus::Expired
    } else {
        LicenseStatus::Valid
    };

    LicenseRecord {
        license_key: claims.license_key.clone(),
        status,
        customer_id: claims.customer_id.clone(),
        customer_name: claims.customer_name.clone(),
        product: claims.product.clone(),
        product_id: claims.product_id.clone(),
        features: claims.features.clone(),
        expires_at: verified.expires_at,
        verified_at: Some(now),
        issued_at: Some(verified.issued_at),
        activations,
        max_activations: claims.max_activations,
        device_id: Some(device_id),
        is_offline: false,
        cached_response: Some(verified.payload.clone()),
    }
}
