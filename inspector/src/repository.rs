//! Read model over the live window and the store
//!
//! Queries run against both sources: the store has everything that was
//! persisted, the collector window has transactions the persistence worker
//! may not have written yet. Results are merged by id, preferring a terminal
//! version over a pending one and the live version otherwise.

use crate::error::StoreResult;
use crate::store::TransactionStore;
use capture_core::query::{merge_newest_first, prefer_fresher};
use capture_core::{
    HttpMethod, NetworkCollector, NetworkTransaction, RuleApplicationResult, TransactionQuery,
    TransactionStatus,
};
use std::collections::{BTreeSet, HashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TransactionRepository {
    store: TransactionStore,
    collector: NetworkCollector,
}

impl TransactionRepository {
    pub fn new(store: TransactionStore, collector: NetworkCollector) -> Self {
        Self { store, collector }
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn collector(&self) -> &NetworkCollector {
        &self.collector
    }

    /// Transactions matching `query`, newest first
    pub async fn query(&self, query: &TransactionQuery) -> StoreResult<Vec<NetworkTransaction>> {
        let live: Vec<NetworkTransaction> = self
            .collector
            .snapshot()
            .iter()
            .map(|tx| NetworkTransaction::clone(tx))
            .collect();

        match query.page() {
            Some((limit, offset)) => {
                // The first offset + limit merged rows come from at most that many stored rows
                let window = u32::try_from(limit.saturating_add(offset)).unwrap_or(u32::MAX);
                let stored = self
                    .store
                    .query(&TransactionQuery::Paged {
                        limit: window,
                        offset: 0,
                    })
                    .await?;

                let stored = self.with_settled_versions(&live, stored).await?;

                Ok(merge_newest_first(live, stored)
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .collect())
            }
            None => {
                let stored = self.store.query(query).await?;
                let stored = self.with_settled_versions(&live, stored).await?;
                Ok(merge_newest_first(live, stored)
                    .into_iter()
                    .filter(|tx| query.matches(tx))
                    .collect())
            }
        }
    }

    /// Add stored rows for live pending transactions that `stored` is missing.
    /// A stored terminal row outranks a live pending one even when it falls
    /// outside the stored query.
    async fn with_settled_versions(
        &self,
        live: &[NetworkTransaction],
        mut stored: Vec<NetworkTransaction>,
    ) -> StoreResult<Vec<NetworkTransaction>> {
        let present: HashSet<&str> = stored.iter().map(|tx| tx.id()).collect();
        let missing: Vec<String> = live
            .iter()
            .filter(|tx| !tx.is_terminal() && !present.contains(tx.id()))
            .map(|tx| tx.id().to_string())
            .collect();
        drop(present);

        if !missing.is_empty() {
            stored.extend(self.store.by_ids(&missing).await?);
        }
        Ok(stored)
    }

    pub async fn all(&self) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::All).await
    }

    pub async fn paged(&self, limit: u32, offset: u32) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::Paged { limit, offset }).await
    }

    /// Transactions started within `[start, end]`
    pub async fn by_time_range(&self, start: i64, end: i64) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::TimeRange { start, end }).await
    }

    pub async fn search(&self, text: &str) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::Search(text.to_string())).await
    }

    pub async fn by_method(&self, method: HttpMethod) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::ByMethod(method)).await
    }

    pub async fn by_status(&self, status: TransactionStatus) -> StoreResult<Vec<NetworkTransaction>> {
        self.query(&TransactionQuery::ByStatus(status)).await
    }

    /// Like [`Self::by_status`] for a textual status; unknown names match nothing
    pub async fn by_status_name(&self, name: &str) -> StoreResult<Vec<NetworkTransaction>> {
        match name.parse::<TransactionStatus>() {
            Ok(status) => self.by_status(status).await,
            Err(e) => {
                debug!("Ignoring status filter: {}", e);
                Ok(Vec::new())
            }
        }
    }

    pub async fn by_id(&self, id: &str) -> StoreResult<Option<NetworkTransaction>> {
        let stored = self.store.by_id(id).await?;
        Ok(match (self.collector.get(id), stored) {
            (Some(live), Some(stored)) => Some(prefer_fresher(live, stored)),
            (live, stored) => live.or(stored),
        })
    }

    pub async fn distinct_methods(&self) -> StoreResult<Vec<HttpMethod>> {
        let mut names: BTreeSet<String> = self
            .store
            .distinct_methods()
            .await?
            .into_iter()
            .map(String::from)
            .collect();
        names.extend(
            self.collector
                .snapshot()
                .iter()
                .map(|tx| tx.request().method.to_string()),
        );
        Ok(names.into_iter().map(HttpMethod::from).collect())
    }

    pub async fn distinct_statuses(&self) -> StoreResult<Vec<TransactionStatus>> {
        let mut statuses: Vec<TransactionStatus> = self.store.distinct_statuses().await?;
        statuses.extend(self.collector.snapshot().iter().map(|tx| tx.status()));
        statuses.sort_by_key(|status| status.as_str());
        statuses.dedup();
        Ok(statuses)
    }

    /// Number of distinct transactions across the window and the store
    pub async fn transaction_count(&self) -> StoreResult<u64> {
        let stored = self.store.count().await?;
        let live_ids: Vec<String> = self
            .collector
            .snapshot()
            .iter()
            .map(|tx| tx.id().to_string())
            .collect();
        let persisted = self.store.existing_ids(&live_ids).await?;
        let unpersisted = live_ids.iter().filter(|id| !persisted.contains(*id)).count();
        Ok(stored + unpersisted as u64)
    }

    /// Events already queued for persistence are drained first so a cleared
    /// transaction is not written back afterwards.
    pub async fn clear_all(&self) -> StoreResult<u64> {
        self.collector.flush().await;
        self.collector.clear_all();
        let deleted = self.store.delete_all().await?;
        info!("Cleared all transactions ({} stored rows)", deleted);
        Ok(deleted)
    }

    /// Remove transactions that started before `timestamp` from both sources.
    /// Returns the number of stored rows deleted.
    pub async fn clear_older_than(&self, timestamp: i64) -> StoreResult<u64> {
        self.collector.flush().await;
        let live = self.collector.clear_older_than(timestamp);
        let stored = self.store.delete_older_than(timestamp).await?;
        debug!(
            "Cleared transactions older than {} ({} live, {} stored)",
            timestamp, live, stored
        );
        Ok(stored)
    }

    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let live = self.collector.remove(id).is_some();
        let stored = self.store.delete(id).await?;
        Ok(live || stored)
    }

    /// Most recent rule applications first
    pub async fn rule_history(&self, limit: u32) -> StoreResult<Vec<RuleApplicationResult>> {
        self.store.recent_rule_applications(limit).await
    }

    pub async fn rule_history_for(&self, transaction_id: &str) -> StoreResult<Vec<RuleApplicationResult>> {
        self.store.rule_applications_for(transaction_id).await
    }

    /// Stream that re-runs `query` whenever the store or the live window changes
    pub fn observe(
        &self,
        query: TransactionQuery,
    ) -> ReceiverStream<StoreResult<Vec<NetworkTransaction>>> {
        let (sender, receiver) = mpsc::channel(16);
        let repository = self.clone();
        let mut stored = self.store.subscribe_changes();
        let mut live = self.collector.subscribe();

        tokio::spawn(async move {
            loop {
                stored.borrow_and_update();
                live.borrow_and_update();

                let result = repository.query(&query).await;
                if sender.send(result).await.is_err() {
                    break;
                }

                tokio::select! {
                    changed = stored.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = live.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sender.closed() => break,
                }
            }
        });

        ReceiverStream::new(receiver)
    }
}
