//! Capture Core Library
//!
//! In-process half of the inspector: the transaction model, the rule engine,
//! the live collector window and the tower layer that records HTTP calls.
//! Storage lives in the `inspector` crate.

pub mod collector;
pub mod config;
pub mod events;
pub mod filter;
pub mod headers;
pub mod interceptor;
pub mod metrics;
pub mod model;
pub mod query;

/// Rule matching, actions and history
pub mod rules;

/// Error types for capture operations
pub mod error;

pub use collector::NetworkCollector;
pub use config::CaptureConfig;
pub use error::CaptureError;
pub use events::{capture_channel, CaptureEvent, CaptureReceiver, CaptureSender};
pub use filter::ScopeMatcher;
pub use headers::Headers;
pub use interceptor::{CaptureLayer, CaptureService};
pub use metrics::{CaptureMetrics, MetricsSnapshot};
pub use model::{
    now_millis, HttpMethod, NetworkRequest, NetworkResponse, NetworkTransaction, TransactionStatus,
};
pub use query::TransactionQuery;
pub use rules::{
    HeaderPredicate, NetworkRule, OutcomeKind, PatternCache, RuleAction, RuleApplicationResult, RuleEngine,
    RuleIssue, RuleOutcome, RuleSet, UrlPattern,
};

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
