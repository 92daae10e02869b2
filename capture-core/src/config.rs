//! Capture configuration

use serde::{Deserialize, Serialize};

/// Settings for the capture layer.
/// These are read when the layer is built and do not change while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Master switch; when off every request passes straight through
    pub enabled: bool,
    /// Number of transactions kept in the live window
    pub window_capacity: usize,
    /// Bodies longer than this are truncated in the record
    pub max_body_bytes: usize,
    /// Record request and response bodies at all
    pub capture_bodies: bool,
    /// Number of rule applications kept in memory
    pub history_capacity: usize,
    /// Only capture these hosts (wildcards allowed). Empty means all hosts.
    pub include_hosts: Vec<String>,
    /// Never capture these hosts (wildcards allowed). Checked first.
    pub ignore_hosts: Vec<String>,
    /// Wait for the persistence worker before returning each response
    pub strict_persistence: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_capacity: 500,
            max_body_bytes: 64 * 1024,
            capture_bodies: true,
            history_capacity: crate::rules::DEFAULT_HISTORY_CAPACITY,
            include_hosts: Vec::new(),
            ignore_hosts: Vec::new(),
            strict_persistence: false,
        }
    }
}
