//! Read-only snapshots handed to consumers.
//!
//! Consumers NEVER mutate these; they receive new snapshots via watch channel.

use crate::errors::SyncError;
use crate::interaction::{compute_interaction, Interaction};
use crate::model::{StatusMessage, Workflow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Sync lifecycle, distinct from the workflow's own status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Not started, or explicitly stopped
    Idle,
    /// Polling
    Syncing,
    /// Terminal outcome observed; polling stopped
    Settled,
    /// Unrecoverable fetch failure; polling stopped, last data kept
    Errored,
}

impl SyncPhase {
    pub fn is_polling(self) -> bool {
        self == Self::Syncing
    }
}

/// State of one workflow sync session.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub phase: SyncPhase,
    pub workflow_id: Option<String>,
    /// Last workflow the server reported. Kept across errors.
    pub workflow: Option<Arc<Workflow>>,
    /// Derived fresh from `workflow` for every snapshot.
    pub interaction: Interaction,
    pub error: Option<SyncError>,
    /// A fetch has been outstanding longer than the stall threshold.
    pub stalled: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Number of fetch results applied in this engine's lifetime.
    pub sync_count: u64,
}

impl SyncSnapshot {
    pub(crate) fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            workflow_id: None,
            workflow: None,
            interaction: Interaction::None,
            error: None,
            stalled: false,
            last_synced_at: None,
            sync_count: 0,
        }
    }

    pub(crate) fn build(
        phase: SyncPhase,
        workflow_id: Option<String>,
        workflow: Option<Arc<Workflow>>,
        error: Option<SyncError>,
        stalled: bool,
        last_synced_at: Option<DateTime<Utc>>,
        sync_count: u64,
    ) -> Self {
        let interaction = workflow
            .as_deref()
            .map(compute_interaction)
            .unwrap_or(Interaction::None);
        Self {
            phase,
            workflow_id,
            workflow,
            interaction,
            error,
            stalled,
            last_synced_at,
            sync_count,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// State of one agent status stream.
#[derive(Debug, Clone)]
pub struct AgentStatusSnapshot {
    pub phase: SyncPhase,
    pub session_id: Option<String>,
    /// Deduplicated messages in arrival order.
    pub messages: Arc<Vec<StatusMessage>>,
    pub cursor: Option<String>,
    pub completed: bool,
    pub result: Option<serde_json::Value>,
    /// Last transport error or server-reported error.
    pub error: Option<String>,
}

impl AgentStatusSnapshot {
    pub(crate) fn idle() -> Self {
        Self {
            phase: SyncPhase::Idle,
            session_id: None,
            messages: Arc::new(Vec::new()),
            cursor: None,
            completed: false,
            result: None,
            error: None,
        }
    }
}
