//! Background persistence of capture events

use crate::error::StoreResult;
use crate::store::TransactionStore;
use capture_core::{CaptureEvent, CaptureMetrics, CaptureReceiver};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Drain `events` into `store` until every sender is dropped.
/// Failures are logged and counted, never returned to the capture path.
pub fn spawn_persistence_worker(
    store: TransactionStore,
    mut events: CaptureReceiver,
    metrics: Arc<CaptureMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Persistence worker started");

        while let Some(event) = events.recv().await {
            let id = event.transaction_id().map(str::to_string);
            if let Err(e) = persist(&store, event).await {
                warn!(
                    "Failed to persist capture event for {}: {}",
                    id.as_deref().unwrap_or("-"),
                    e
                );
                CaptureMetrics::incr(&metrics.persistence_failures);
            }
        }

        info!("Persistence worker stopped");
    })
}

/// Apply one capture event to the store
pub async fn persist(store: &TransactionStore, event: CaptureEvent) -> StoreResult<()> {
    match event {
        CaptureEvent::Started(tx) => store.insert(&tx).await,
        CaptureEvent::Completed {
            id,
            response,
            end_time,
        } => store
            .finish_completed(&id, &response, end_time)
            .await
            .map(|_| ()),
        CaptureEvent::Failed {
            id,
            error,
            end_time,
        } => store.finish_failed(&id, &error, end_time).await.map(|_| ()),
        CaptureEvent::RuleApplied(result) => store.append_rule_application(&result).await,
        CaptureEvent::Flush(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    }
}
