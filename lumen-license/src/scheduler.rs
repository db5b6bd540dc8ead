//! Periodic background re-verification.
//!
//! Ticks go through [`LicenseEngine::refresh`], so they share the engine's
//! single-flight gate with manual refreshes and never start a second
//! authority call for the same key.

use crate::config::LicenseConfig;
use crate::engine::LicenseEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawns re-verification loops.
pub struct RevalidationScheduler;

impl RevalidationScheduler {
    /// Starts re-verifying every `interval`, or every `offline_retry` after
    /// the authority was unreachable.
    pub fn spawn(engine: LicenseEngine, interval: Duration, offline_retry: Duration) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticks = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(engine, interval, offline_retry, shutdown_rx, Arc::clone(&ticks)));

        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
            ticks,
        }
    }

    /// Starts a loop with the intervals from `config`.
    pub fn from_config(engine: LicenseEngine, config: &LicenseConfig) -> SchedulerHandle {
        Self::spawn(
            engine,
            config.revalidation_interval(),
            config.offline_retry_interval(),
        )
    }
}

/// Handle to a running scheduler. Dropping it also stops future ticks.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
}

impl SchedulerHandle {
    /// Number of ticks fired so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Returns true while the loop is alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops future ticks and waits for the loop to exit. A refresh already
    /// handed to the engine is left to finish on its own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("License scheduler task ended abnormally: {}", e);
        }
    }
}

async fn run(
    engine: LicenseEngine,
    interval: Duration,
    offline_retry: Duration,
    mut shutdown: watch::Receiver<bool>,
    ticks: Arc<AtomicU64>,
) {
    info!("License revalidation every {:?}", interval);
    let mut delay = interval;

    loop {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        ticks.fetch_add(1, Ordering::Relaxed);

        if !engine.is_activated().await {
            debug!("No license activated; skipping revalidation");
            delay = interval;
            continue;
        }

        let outcome = tokio::select! {
            outcome = engine.refresh() => outcome,
            _ = shutdown.changed() => break,
        };

        delay = match outcome {
            Ok(state) => {
                debug!("Scheduled revalidation: {}", state.status);
                interval
            }
            Err(e) if e.is_retryable() => {
                let status = engine.get_status().await.status;
                warn!("Scheduled revalidation offline ({}): {}", status, e);
                offline_retry
            }
            Err(e) => {
                warn!("Scheduled revalidation failed: {}", e);
                interval
            }
        };
    }

    debug!("License scheduler stopped");
}
