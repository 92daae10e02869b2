//! Inspector service
//!
//! Wires the capture layer from `capture-core` to a SQLite store: captured
//! transactions and rule applications flow through a background persistence
//! worker, the repository merges the live window with stored history, and a
//! cleanup scheduler prunes old rows. A small REST API exposes all of it.

pub mod cleanup;
pub mod error;
pub mod http;
pub mod logging;
pub mod repository;
pub mod rules;
pub mod store;
pub mod worker;

pub use cleanup::{CleanupConfig, CleanupScheduler};
pub use error::{InspectorError, Result, StoreError, StoreResult};
pub use http::{router, ApiState};
pub use logging::{init_logging, LoggingConfig};
pub use repository::TransactionRepository;
pub use rules::{ImportMode, ImportSummary, RuleService};
pub use store::TransactionStore;

use axum::Router;
use capture_core::{
    capture_channel, CaptureConfig, CaptureLayer, CaptureMetrics, NetworkCollector, RuleEngine,
    RuleSet,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub database_url: String,
    pub http_port: u16,
    pub capture: CaptureConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://inspector.db".to_string(),
            http_port: 9090,
            capture: CaptureConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Running inspector: store, capture pipeline and background tasks
pub struct Inspector {
    config: InspectorConfig,
    store: TransactionStore,
    collector: NetworkCollector,
    engine: RuleEngine,
    rules: RuleService,
    repository: TransactionRepository,
    metrics: Arc<CaptureMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inspector {
    /// Open the configured database and start the persistence worker
    pub async fn start(config: InspectorConfig) -> Result<Self> {
        let store = TransactionStore::new(&config.database_url).await?;
        Self::with_store(config, store).await
    }

    /// Start on top of an already opened store
    pub async fn with_store(config: InspectorConfig, store: TransactionStore) -> Result<Self> {
        let (sender, receiver) = capture_channel();
        let metrics = Arc::new(CaptureMetrics::default());

        let worker = worker::spawn_persistence_worker(store.clone(), receiver, metrics.clone());

        let collector =
            NetworkCollector::new(config.capture.window_capacity).with_event_sender(sender.clone());
        let engine = RuleEngine::new(config.capture.history_capacity).with_event_sender(sender);
        let rules = RuleService::load(store.clone(), RuleSet::default()).await?;
        let repository = TransactionRepository::new(store.clone(), collector.clone());

        info!(
            "✓ Inspector ready (window {}, {} rules)",
            collector.capacity(),
            rules.rule_set().len()
        );

        Ok(Self {
            config,
            store,
            collector,
            engine,
            rules,
            repository,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(vec![worker]),
        })
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    /// Tower layer that records every HTTP call passing through it
    pub fn capture_layer(&self) -> CaptureLayer {
        CaptureLayer::new(
            self.collector.clone(),
            self.engine.clone(),
            self.rules.rule_set().clone(),
        )
        .with_config(self.config.capture.clone())
        .with_metrics(self.metrics.clone())
    }

    pub fn repository(&self) -> &TransactionRepository {
        &self.repository
    }

    pub fn rules(&self) -> &RuleService {
        &self.rules
    }

    pub fn collector(&self) -> &NetworkCollector {
        &self.collector
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn metrics(&self) -> Arc<CaptureMetrics> {
        self.metrics.clone()
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        router(ApiState {
            repository: self.repository.clone(),
            rules: self.rules.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Start the cleanup scheduler if enabled in the configuration
    pub async fn spawn_cleanup(&self) -> bool {
        if !self.config.cleanup.enabled {
            info!("Cleanup scheduler disabled");
            return false;
        }

        let scheduler = CleanupScheduler::from_config(self.repository.clone(), &self.config.cleanup);
        let handle = scheduler.spawn(self.shutdown.child_token());
        self.tasks.lock().await.push(handle);
        true
    }

    /// Serve the REST API until shutdown
    pub async fn serve(&self) -> Result<()> {
        http::serve(self.router(), self.config.http_port, self.shutdown.child_token()).await
    }

    /// Wait until every event captured so far has been persisted
    pub async fn flush(&self) {
        self.collector.flush().await;
    }

    /// Stop background tasks and close the store.
    ///
    /// Captured events are flushed first. The persistence worker itself only
    /// exits once every capture layer handed out has been dropped, so it is
    /// not awaited.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        // The first task is the persistence worker
        for handle in tasks.drain(..).skip(1) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        drop(tasks);

        self.store.close().await;
        info!("Inspector stopped");
    }
}
