//! Background auto-update sweep
//!
//! Every `check_interval_secs` the scheduler runs [`AppStore::auto_update`]
//! for each subscribed package. A package whose attempt fails is skipped
//! until its backoff expires; the delay doubles per consecutive failure, up
//! to `max_backoff_secs`.

use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AppStore, AutoUpdateOutcome};
use crate::config::UpdateConfig;
use crate::types::PackageId;

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub checked: usize,
    pub updated: usize,
    pub awaiting_approval: usize,
    pub failed: usize,
    /// Still backing off or busy
    pub skipped: usize,
}

pub struct AutoUpdateScheduler {
    store: Arc<AppStore>,
    interval: Duration,
    max_backoff: Duration,
    backoff: DashMap<PackageId, Backoff>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl AutoUpdateScheduler {
    pub fn new(store: Arc<AppStore>, interval: Duration, max_backoff: Duration) -> Self {
        Self {
            store,
            interval,
            max_backoff,
            backoff: DashMap::new(),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn from_config(store: Arc<AppStore>, config: &UpdateConfig) -> Self {
        Self::new(
            store,
            Duration::from_secs(config.check_interval_secs.max(1)),
            Duration::from_secs(config.max_backoff_secs),
        )
    }

    /// Start the sweep loop
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            max_backoff_secs = self.max_backoff.as_secs(),
            "Starting auto-update scheduler"
        );

        let (tx, mut rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(tx);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = scheduler.sweep().await;
                        debug!(?report, "Auto-update sweep finished");
                    }
                    _ = rx.recv() => {
                        info!("Auto-update scheduler stopped");
                        break;
                    }
                }
            }
        })
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Run auto-update once for every subscribed package that is not backing off
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        let due: Vec<PackageId> = self
            .store
            .auto_update_subscriptions()
            .into_iter()
            .filter(|package_id| match self.backoff.get(package_id) {
                Some(b) if b.retry_at > now => {
                    report.skipped += 1;
                    false
                }
                _ => true,
            })
            .collect();

        let attempts = due.iter().map(|package_id| async move {
            (package_id, self.store.auto_update(package_id).await)
        });

        for (package_id, result) in join_all(attempts).await {
            report.checked += 1;
            match result {
                Ok(AutoUpdateOutcome::Busy) => report.skipped += 1,
                Ok(outcome) => {
                    self.backoff.remove(package_id);
                    match outcome {
                        AutoUpdateOutcome::Updated { .. } => report.updated += 1,
                        AutoUpdateOutcome::AwaitingApproval { .. } => report.awaiting_approval += 1,
                        _ => {}
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let delay = self.record_failure(package_id);
                    warn!(
                        package = %package_id,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Auto-update failed, backing off"
                    );
                }
            }
        }

        if report.updated > 0 || report.failed > 0 {
            info!(
                checked = report.checked,
                updated = report.updated,
                failed = report.failed,
                "Auto-update sweep"
            );
        }
        report
    }

    fn record_failure(&self, package_id: &PackageId) -> Duration {
        let mut entry = self.backoff.entry(package_id.clone()).or_insert(Backoff {
            failures: 0,
            retry_at: Instant::now(),
        });
        entry.failures += 1;
        let delay = backoff_delay(self.interval, self.max_backoff, entry.failures);
        entry.retry_at = Instant::now() + delay;
        delay
    }

    /// Consecutive failures recorded for a package
    pub fn failures(&self, package_id: &PackageId) -> u32 {
        self.backoff.get(package_id).map(|b| b.failures).unwrap_or(0)
    }

    /// Forget a package's backoff, e.g. after an operator retry
    pub fn reset_backoff(&self, package_id: &PackageId) {
        self.backoff.remove(package_id);
    }
}

/// `base * 2^(failures - 1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(120));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(base, max, 5), max);
        assert_eq!(backoff_delay(base, max, 400), max);
    }
}
