//! SQLite persistence for transactions, rules and rule history
//!
//! File databases run in WAL mode so readers never wait on the persistence
//! worker. Every mutation bumps a change counter that observable queries
//! listen on.

use crate::error::StoreResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

mod history;
mod rules;
mod transactions;

pub use transactions::TransactionRow;

#[derive(Debug, Clone)]
pub struct TransactionStore {
    pool: Pool<Sqlite>,
    changes: Arc<watch::Sender<u64>>,
}

impl TransactionStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = if in_memory {
            // Each connection to an in-memory database sees its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(
                    options
                        .journal_mode(SqliteJournalMode::Wal)
                        .synchronous(SqliteSynchronous::Normal),
                )
                .await?
        };

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✓ Database initialized and migrated at {}", database_url);

        let (changes, _) = watch::channel(0);
        Ok(Self {
            pool,
            changes: Arc::new(changes),
        })
    }

    /// Open (creating if needed) a database file
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::new(&format!("sqlite://{}", path.as_ref().display())).await
    }

    pub async fn in_memory() -> StoreResult<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Receiver that changes after every store mutation
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub(crate) fn notify_changed(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
