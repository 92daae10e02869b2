//! Capture events sent from the live pipeline to persistence

use crate::model::{NetworkResponse, NetworkTransaction};
use crate::rules::RuleApplicationResult;
use tokio::sync::{mpsc, oneshot};

pub type CaptureSender = mpsc::UnboundedSender<CaptureEvent>;
pub type CaptureReceiver = mpsc::UnboundedReceiver<CaptureEvent>;

/// One step of a transaction's lifecycle, or a rule application record.
/// Events for the same transaction are sent in lifecycle order.
#[derive(Debug)]
pub enum CaptureEvent {
    Started(NetworkTransaction),
    Completed {
        id: String,
        response: NetworkResponse,
        end_time: i64,
    },
    Failed {
        id: String,
        error: String,
        end_time: i64,
    },
    RuleApplied(RuleApplicationResult),
    /// Acknowledged once every event sent before it has been handled
    Flush(oneshot::Sender<()>),
}

impl CaptureEvent {
    /// Transaction the event refers to, if any
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            CaptureEvent::Started(tx) => Some(tx.id()),
            CaptureEvent::Completed { id, .. } | CaptureEvent::Failed { id, .. } => Some(id),
            CaptureEvent::RuleApplied(result) => Some(&result.transaction_id),
            CaptureEvent::Flush(_) => None,
        }
    }
}

/// Unbounded channel carrying capture events; sends never block the caller
pub fn capture_channel() -> (CaptureSender, CaptureReceiver) {
    mpsc::unbounded_channel()
}
