//! Periodic pruning of old transactions

use crate::error::StoreResult;
use crate::repository::TransactionRepository;
use capture_core::now_millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Seconds between runs
    pub interval_secs: u64,
    /// Transactions older than this many seconds are removed
    pub retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 60 * 60,
            retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    repository: TransactionRepository,
    retention: Duration,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(repository: TransactionRepository, retention: Duration, interval: Duration) -> Self {
        Self {
            repository,
            retention,
            // tokio intervals reject a zero period
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(repository: TransactionRepository, config: &CleanupConfig) -> Self {
        Self::new(
            repository,
            Duration::from_secs(config.retention_secs),
            Duration::from_secs(config.interval_secs),
        )
    }

    /// Remove everything that started before `now - retention`.
    /// Returns the number of stored rows deleted.
    pub async fn run_once_at(&self, now: i64) -> StoreResult<u64> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention_ms);

        let deleted = self.repository.clear_older_than(cutoff).await?;
        if deleted > 0 {
            info!("Cleanup removed {} transactions older than {}", deleted, cutoff);
        } else {
            debug!("Cleanup found nothing older than {}", cutoff);
        }
        Ok(deleted)
    }

    pub async fn run_once(&self) -> StoreResult<u64> {
        self.run_once_at(now_millis()).await
    }

    /// Run every `interval`, first after one full interval, until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Cleanup scheduler started (every {:?}, retention {:?})",
                self.interval, self.retention
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!("Cleanup failed, retrying next tick: {}", e);
                        }
                    }
                }
            }

            info!("Cleanup scheduler stopped");
        })
    }
}
