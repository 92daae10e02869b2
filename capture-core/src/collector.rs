//! Live transaction window
//!
//! The collector keeps the most recent transactions in memory and publishes
//! a newest-first snapshot after every change. Each lifecycle callback is also
//! forwarded as a [`CaptureEvent`] so that persistence sees every transaction,
//! including the ones evicted from the window.

use crate::events::{CaptureEvent, CaptureSender};
use crate::model::{NetworkResponse, NetworkTransaction};
use crate::query::{newest_first, TransactionQuery};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

/// Newest-first view of the window. Entries are shared with the window, so
/// publishing a snapshot never copies request or response bodies.
pub type Snapshot = Arc<Vec<Arc<NetworkTransaction>>>;

struct Inner {
    entries: DashMap<String, Arc<NetworkTransaction>>,
    capacity: usize,
    eviction: Mutex<()>,
    snapshot: watch::Sender<Snapshot>,
}

#[derive(Clone)]
pub struct NetworkCollector {
    inner: Arc<Inner>,
    events: Option<CaptureSender>,
}

impl std::fmt::Debug for NetworkCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCollector")
            .field("len", &self.inner.entries.len())
            .field("capacity", &self.inner.capacity)
            .field("forwarding", &self.events.is_some())
            .finish()
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl NetworkCollector {
    pub fn new(capacity: usize) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                capacity: capacity.max(1),
                eviction: Mutex::new(()),
                snapshot,
            }),
            events: None,
        }
    }

    /// Forward lifecycle callbacks to `sender`
    pub fn with_event_sender(mut self, sender: CaptureSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn on_transaction_started(&self, transaction: NetworkTransaction) {
        debug!(
            "Transaction started: {} {} {}",
            transaction.id(),
            transaction.request().method,
            transaction.request().url
        );

        let shared = Arc::new(transaction);
        self.inner
            .entries
            .insert(shared.id().to_string(), Arc::clone(&shared));
        self.evict_overflow();
        self.publish();
        if self.events.is_some() {
            self.forward(CaptureEvent::Started(NetworkTransaction::clone(&shared)));
        }
    }

    pub fn on_transaction_completed(&self, id: &str, response: NetworkResponse, end_time: i64) {
        let accepted = match self.inner.entries.get_mut(id) {
            Some(mut entry) => match Arc::make_mut(entry.value_mut()).complete(response.clone(), end_time) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Ignoring completion callback: {}", e);
                    false
                }
            },
            // Evicted from the window; the store still needs it
            None => true,
        };

        if accepted {
            debug!("Transaction completed: {} ({})", id, response.status_code);
            self.publish();
            self.forward(CaptureEvent::Completed {
                id: id.to_string(),
                response,
                end_time,
            });
        }
    }

    pub fn on_transaction_failed(&self, id: &str, error: impl Into<String>, end_time: i64) {
        let error = error.into();
        let accepted = match self.inner.entries.get_mut(id) {
            Some(mut entry) => match Arc::make_mut(entry.value_mut()).fail(error.clone(), end_time) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Ignoring failure callback: {}", e);
                    false
                }
            },
            None => true,
        };

        if accepted {
            debug!("Transaction failed: {} ({})", id, error);
            self.publish();
            self.forward(CaptureEvent::Failed {
                id: id.to_string(),
                error,
                end_time,
            });
        }
    }

    /// Stream of newest-first snapshots, starting with the current one
    pub fn transactions(&self) -> WatchStream<Snapshot> {
        WatchStream::new(self.inner.snapshot.subscribe())
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Current window, newest first
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Transactions in the window matching `query`, newest first, unpaged
    pub fn filtered(&self, query: &TransactionQuery) -> Vec<NetworkTransaction> {
        self.snapshot()
            .iter()
            .filter(|tx| query.matches(tx))
            .map(|tx| NetworkTransaction::clone(tx))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<NetworkTransaction> {
        self.inner
            .entries
            .get(id)
            .map(|entry| NetworkTransaction::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> Option<NetworkTransaction> {
        let removed = self
            .inner
            .entries
            .remove(id)
            .map(|(_, tx)| Arc::try_unwrap(tx).unwrap_or_else(|shared| NetworkTransaction::clone(&shared)));
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn clear_all(&self) {
        self.inner.entries.clear();
        self.publish();
    }

    /// Drop entries that started before `timestamp`; returns how many were removed
    pub fn clear_older_than(&self, timestamp: i64) -> usize {
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, tx| tx.start_time() >= timestamp);
        let removed = before.saturating_sub(self.inner.entries.len());
        if removed > 0 {
            self.publish();
        }
        removed
    }

    /// Wait until every event forwarded so far has been handled downstream
    pub async fn flush(&self) {
        let Some(events) = &self.events else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if events.send(CaptureEvent::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn evict_overflow(&self) {
        let _guard = self.inner.eviction.lock();
        while self.inner.entries.len() > self.inner.capacity {
            let oldest = self
                .inner
                .entries
                .iter()
                .max_by(|a, b| newest_first(a.value(), b.value()))
                .map(|entry| entry.key().clone());

            match oldest {
                Some(id) => {
                    debug!("Evicting transaction {} from the live window", id);
                    self.inner.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn publish(&self) {
        // The snapshot is rebuilt under the channel lock so publications never go backwards
        self.inner.snapshot.send_modify(|current| {
            let mut list: Vec<Arc<NetworkTransaction>> = self
                .inner
                .entries
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            list.sort_by(|a, b| newest_first(a, b));
            *current = Arc::new(list);
        });
    }

    fn forward(&self, event: CaptureEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Capture event receiver closed; event dropped");
            }
        }
    }
}
