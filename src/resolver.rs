//! User-driven resolution of the current interaction.
//!
//! Each action is one-shot per target: a second call while the first is still
//! outstanding is dropped with a warning. A successful action is followed by a
//! forced sync so the resolved interaction disappears from the next snapshot.
//! The resolver never edits the workflow itself.

use crate::errors::{ResolutionError, SyncError};
use crate::interaction::{awaits_decision, Interaction, ToolKind};
use crate::model::{Step, Workflow, WorkflowStatus};
use crate::sync_engine::{SyncEvent, SyncSnapshot, WorkflowSyncEngine};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

const COMPONENT: &str = "InteractionResolver";

/// Outcome of a resolution call that did not fail.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The action reached the service; carries the snapshot after resync.
    Submitted(SyncSnapshot),
    /// The action reached the service but the follow-up sync did not run,
    /// usually because the engine was stopped or restarted meanwhile. Must
    /// not be retried.
    SubmittedWithoutResync(SyncError),
    /// The same target already has an action outstanding. Nothing was sent.
    AlreadyInFlight,
}

impl Resolution {
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted(_) | Self::SubmittedWithoutResync(_))
    }
}

pub struct InteractionResolver {
    engine: Arc<WorkflowSyncEngine>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    last_error: Mutex<Option<ResolutionError>>,
}

/// Releases an in-flight key when the action finishes or is cancelled.
struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl InteractionResolver {
    pub fn new(engine: Arc<WorkflowSyncEngine>) -> Self {
        Self {
            engine,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_error: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowSyncEngine> {
        &self.engine
    }

    /// Error of the most recent failed resolution. Cleared by the next
    /// successful one.
    pub fn last_error(&self) -> Option<ResolutionError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an action for `key` is outstanding. Keys are step ids, or
    /// `context:<workflow id>` for context injection.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Accepts or rejects the confirmation pending on `step_id`.
    ///
    /// Email steps are sent or rejected through the email endpoints; any other
    /// confirmation step goes through `confirm_step`.
    pub async fn resolve_confirmation(
        &self,
        step_id: &str,
        accepted: bool,
    ) -> Result<Resolution, ResolutionError> {
        let action = if accepted { "confirm" } else { "reject" };
        let Some(_guard) = self.claim(step_id, action) else {
            return Ok(Resolution::AlreadyInFlight);
        };
        let result = self.confirm(step_id, accepted).await;
        self.finish(action, step_id, result)
    }

    /// Picks `selected_key` from the candidates of the job selection pending
    /// on `step_id`. Unknown keys fail before anything is sent.
    pub async fn resolve_job_selection(
        &self,
        step_id: &str,
        selected_key: &str,
    ) -> Result<Resolution, ResolutionError> {
        let action = "select_job";
        let Some(_guard) = self.claim(step_id, action) else {
            return Ok(Resolution::AlreadyInFlight);
        };
        let result = self.select_job(step_id, selected_key).await;
        self.finish(action, step_id, result)
    }

    /// Grants the workflow access to the user's protected context.
    pub async fn resolve_user_context_injection(
        &self,
        workflow_id: &str,
    ) -> Result<Resolution, ResolutionError> {
        let action = "inject_context";
        let key = format!("context:{}", workflow_id);
        let Some(_guard) = self.claim(&key, action) else {
            return Ok(Resolution::AlreadyInFlight);
        };
        let result = self.inject_context(workflow_id).await;
        self.finish(action, workflow_id, result)
    }

    fn claim(&self, key: &str, action: &str) -> Option<InFlightGuard> {
        let mut keys = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.to_string()) {
            tracing::warn!(key, action, "resolution already in flight, ignoring");
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.in_flight),
            key: key.to_string(),
        })
    }

    async fn confirm(&self, step_id: &str, accepted: bool) -> Result<Resolution, ResolutionError> {
        let snapshot = self.engine.snapshot();
        let workflow = loaded(&snapshot)?;
        let step = current_step(workflow, step_id)?;
        let transport = self.engine.transport();

        match (&snapshot.interaction, ToolKind::of(step)) {
            (Interaction::NeedsEmailConfirmation { step_id: pending, .. }, _) if pending == step_id => {
                if accepted {
                    transport.send_email(step_id).await?;
                } else {
                    transport.reject_email(step_id).await?;
                }
            }
            (_, ToolKind::Other) if awaits_decision(workflow, step) => {
                transport.confirm_step(&workflow.id, accepted).await?;
            }
            _ => {
                return Err(ResolutionError::StaleInteraction {
                    step_id: step_id.to_string(),
                    reason: "step is not awaiting confirmation".to_string(),
                })
            }
        }

        self.resync().await
    }

    async fn select_job(
        &self,
        step_id: &str,
        selected_key: &str,
    ) -> Result<Resolution, ResolutionError> {
        let snapshot = self.engine.snapshot();
        let workflow = loaded(&snapshot)?;
        current_step(workflow, step_id)?;

        let candidates = match &snapshot.interaction {
            Interaction::NeedsJobSelection { step_id: pending, .. } if pending == step_id => {
                snapshot.interaction.candidate_keys()
            }
            _ => {
                return Err(ResolutionError::StaleInteraction {
                    step_id: step_id.to_string(),
                    reason: "step is not awaiting a job selection".to_string(),
                })
            }
        };
        if !candidates.iter().any(|k| k == selected_key) {
            return Err(ResolutionError::InvalidSelection {
                key: selected_key.to_string(),
                candidates,
            });
        }

        self.engine
            .transport()
            .select_job(&workflow.id, selected_key)
            .await?;
        self.resync().await
    }

    async fn inject_context(&self, workflow_id: &str) -> Result<Resolution, ResolutionError> {
        let snapshot = self.engine.snapshot();
        let workflow = loaded(&snapshot)?;
        if workflow.id != workflow_id || workflow.status != WorkflowStatus::WaitingUserInput {
            return Err(ResolutionError::StaleInteraction {
                step_id: snapshot
                    .interaction
                    .step_id()
                    .unwrap_or(workflow_id)
                    .to_string(),
                reason: format!("workflow {} is not waiting for user context", workflow_id),
            });
        }

        self.engine
            .transport()
            .inject_user_context(workflow_id)
            .await?;
        self.resync().await
    }

    async fn resync(&self) -> Result<Resolution, ResolutionError> {
        match self.engine.force_sync().await {
            Ok(snapshot) => Ok(Resolution::Submitted(snapshot)),
            Err(error) => {
                tracing::warn!(error = %error, "resync after resolution failed");
                Ok(Resolution::SubmittedWithoutResync(error))
            }
        }
    }

    fn finish(
        &self,
        action: &str,
        target: &str,
        result: Result<Resolution, ResolutionError>,
    ) -> Result<Resolution, ResolutionError> {
        let events = self.engine.events();
        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(resolution) => {
                tracing::info!(action, target, "resolution submitted");
                events.emit(
                    COMPONENT,
                    SyncEvent::ResolutionSubmitted {
                        action: action.to_string(),
                        target: target.to_string(),
                    },
                );
                *last_error = None;
                Ok(resolution)
            }
            Err(error) => {
                tracing::warn!(action, target, error = %error, "resolution failed");
                events.emit(
                    COMPONENT,
                    SyncEvent::ResolutionFailed {
                        action: action.to_string(),
                        target: target.to_string(),
                        error: error.to_string(),
                    },
                );
                *last_error = Some(error.clone());
                Err(error)
            }
        }
    }
}

fn loaded(snapshot: &SyncSnapshot) -> Result<&Workflow, ResolutionError> {
    snapshot
        .workflow
        .as_deref()
        .ok_or(ResolutionError::NoWorkflow)
}

fn current_step<'a>(workflow: &'a Workflow, step_id: &str) -> Result<&'a Step, ResolutionError> {
    match workflow.current_step() {
        Some(step) if step.id == step_id => Ok(step),
        _ => Err(ResolutionError::StaleInteraction {
            step_id: step_id.to_string(),
            reason: "step is no longer the current step".to_string(),
        }),
    }
}

#[cfg(test)]
#[path = "tests/resolver_tests.rs"]
mod tests;
