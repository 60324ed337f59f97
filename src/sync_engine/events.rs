//! Events emitted by the engines and the resolver.
//!
//! These are for logging and notification only. Consumers get state from
//! snapshots on the watch channel, never from events.

use super::snapshot::SyncPhase;
use crate::interaction::InteractionKind;
use crate::model::WorkflowStatus;
use crate::structured_logger::SyncEventLog;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Sync lifecycle moved between phases
    PhaseChanged {
        subject: String,
        from: SyncPhase,
        to: SyncPhase,
    },
    /// A fetched workflow changed status or current step
    WorkflowUpdated {
        workflow_id: String,
        status: WorkflowStatus,
        current_step_number: u32,
    },
    /// The derived interaction changed kind or step
    InteractionChanged {
        workflow_id: String,
        from: InteractionKind,
        to: InteractionKind,
        step_id: Option<String>,
    },
    /// New status messages were appended to a stream
    MessagesMerged {
        session_id: String,
        added: usize,
        cursor: Option<String>,
    },
    /// A fetch failed
    SyncFailed { subject: String, error: String },
    /// A fetch has been outstanding longer than the stall threshold
    Stalled { subject: String, waited_ms: u64 },
    /// A resolution action reached the service
    ResolutionSubmitted { action: String, target: String },
    /// A resolution action was rejected locally or by the service
    ResolutionFailed {
        action: String,
        target: String,
        error: String,
    },
}

/// Fans events out to `tracing` and, when configured, the JSONL event log.
#[derive(Clone, Default)]
pub struct EventSink {
    log: Option<Arc<SyncEventLog>>,
}

impl EventSink {
    pub fn new(log: Option<Arc<SyncEventLog>>) -> Self {
        Self { log }
    }

    pub fn emit(&self, component: &str, event: SyncEvent) {
        tracing::debug!(component, ?event, "sync event");
        if let Some(log) = &self.log {
            log.log_sync_event(component, &event);
        }
    }
}
