//! Query shapes shared by the live window and the persistent store
//!
//! The in-memory predicate in [`TransactionQuery::matches`] mirrors the SQL the
//! store runs for the same query, so merged results agree on membership.

use crate::model::{HttpMethod, NetworkTransaction, TransactionStatus};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionQuery {
    All,
    Paged { limit: u32, offset: u32 },
    /// Inclusive on both ends, by start time
    TimeRange { start: i64, end: i64 },
    /// Substring over url, method and response status code, ignoring ASCII case
    Search(String),
    ByMethod(HttpMethod),
    ByStatus(TransactionStatus),
}

impl TransactionQuery {
    pub fn matches(&self, tx: &NetworkTransaction) -> bool {
        match self {
            TransactionQuery::All | TransactionQuery::Paged { .. } => true,
            TransactionQuery::TimeRange { start, end } => {
                tx.start_time() >= *start && tx.start_time() <= *end
            }
            TransactionQuery::Search(needle) => {
                let needle = needle.to_ascii_lowercase();
                let request = tx.request();
                request.url.to_ascii_lowercase().contains(&needle)
                    || request.method.as_str().to_ascii_lowercase().contains(&needle)
                    || tx
                        .response()
                        .map(|r| r.status_code.to_string().contains(&needle))
                        .unwrap_or(false)
            }
            TransactionQuery::ByMethod(method) => &tx.request().method == method,
            TransactionQuery::ByStatus(status) => tx.status() == *status,
        }
    }

    /// Limit and offset for paged queries
    pub fn page(&self) -> Option<(usize, usize)> {
        match self {
            TransactionQuery::Paged { limit, offset } => Some((*limit as usize, *offset as usize)),
            _ => None,
        }
    }
}

/// Ordering used by every listing: start time descending, then id ascending
pub fn newest_first(a: &NetworkTransaction, b: &NetworkTransaction) -> Ordering {
    b.start_time()
        .cmp(&a.start_time())
        .then_with(|| a.id().cmp(b.id()))
}

/// Pick the version of a transaction to show when both sources have it.
/// A terminal version wins over a pending one; otherwise the live one wins.
pub fn prefer_fresher(live: NetworkTransaction, stored: NetworkTransaction) -> NetworkTransaction {
    if !live.is_terminal() && stored.is_terminal() {
        stored
    } else {
        live
    }
}

/// Union of live and stored transactions, deduplicated by id and sorted newest first
pub fn merge_newest_first(
    live: Vec<NetworkTransaction>,
    stored: Vec<NetworkTransaction>,
) -> Vec<NetworkTransaction> {
    let mut by_id: HashMap<String, NetworkTransaction> =
        HashMap::with_capacity(live.len() + stored.len());

    for tx in stored {
        by_id.insert(tx.id().to_string(), tx);
    }
    for tx in live {
        let merged = match by_id.remove(tx.id()) {
            Some(stored) => prefer_fresher(tx, stored),
            None => tx,
        };
        by_id.insert(merged.id().to_string(), merged);
    }

    let mut merged: Vec<NetworkTransaction> = by_id.into_values().collect();
    merged.sort_by(newest_first);
    merged
}
