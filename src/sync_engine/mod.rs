//! Workflow status synchronization.
//!
//! `WorkflowSyncEngine` is the ONLY owner of the workflow aggregate. It polls
//! the service, replaces the aggregate on every successful fetch, derives the
//! current interaction and broadcasts snapshots to subscribers via a watch
//! channel.
//!
//! Locking rule: the state mutex is never held while touching a `PollSession`
//! (stop, drop or `is_active`). Poll callbacks run under the session's own
//! lock and take the state mutex, so the reverse order would deadlock.

mod agent_status;
mod events;
mod snapshot;

pub use agent_status::AgentStatusSync;
pub use events::{EventSink, SyncEvent};
pub use snapshot::{AgentStatusSnapshot, SyncPhase, SyncSnapshot};

use crate::config::SyncConfig;
use crate::errors::SyncError;
use crate::interaction::{compute_interaction, InteractionKind};
use crate::model::Workflow;
use crate::poller::{PollSession, StatusPoller};
use crate::transport::WorkflowTransport;
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

const COMPONENT: &str = "WorkflowSync";

/// Owns one workflow sync session at a time.
pub struct WorkflowSyncEngine {
    core: Arc<Core>,
}

struct Core {
    transport: Arc<dyn WorkflowTransport>,
    config: SyncConfig,
    state: Mutex<EngineState>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    /// Held for the duration of every fetch. Timer ticks skip when it is taken;
    /// forced syncs wait for it.
    fetch_gate: tokio::sync::Mutex<()>,
    events: EventSink,
}

struct EngineState {
    phase: SyncPhase,
    workflow_id: Option<String>,
    /// Bumped on every start/stop; results from older generations are dropped.
    generation: u64,
    workflow: Option<Arc<Workflow>>,
    error: Option<SyncError>,
    stalled: bool,
    last_synced_at: Option<DateTime<Utc>>,
    sync_count: u64,
    session: Option<PollSession>,
    /// Whether `session` is still polling. Tracked here so the session's own
    /// lock is never needed while the state lock is held.
    polling: bool,
}

/// What applying a fetch outcome did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// Result belonged to a stopped or replaced session and was dropped.
    Stale,
    Continue,
    Settled,
    Errored,
}

impl Applied {
    fn flow(self) -> ControlFlow<()> {
        match self {
            Self::Continue => ControlFlow::Continue(()),
            Self::Stale | Self::Settled | Self::Errored => ControlFlow::Break(()),
        }
    }
}

impl WorkflowSyncEngine {
    pub fn new(transport: Arc<dyn WorkflowTransport>, config: SyncConfig) -> Self {
        Self::with_events(transport, config, EventSink::default())
    }

    pub fn with_events(
        transport: Arc<dyn WorkflowTransport>,
        config: SyncConfig,
        events: EventSink,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SyncSnapshot::idle());
        let core = Core {
            transport,
            config,
            state: Mutex::new(EngineState {
                phase: SyncPhase::Idle,
                workflow_id: None,
                generation: 0,
                workflow: None,
                error: None,
                stalled: false,
                last_synced_at: None,
                sync_count: 0,
                session: None,
                polling: false,
            }),
            snapshot_tx,
            fetch_gate: tokio::sync::Mutex::new(()),
            events,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Starts syncing `workflow_id`.
    ///
    /// Only one workflow is synced per engine: a different id stops the
    /// previous session first and drops its data. Starting the id that is
    /// already `Syncing` is a no-op. Must be called inside a tokio runtime.
    pub fn start(&self, workflow_id: &str) -> Result<(), SyncError> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(SyncError::InvalidWorkflowId);
        }

        let previous = {
            let mut guard = self.core.lock_state();
            let state = &mut *guard;
            if state.phase == SyncPhase::Syncing
                && state.workflow_id.as_deref() == Some(workflow_id)
            {
                return Ok(());
            }

            if let Some(current) = state.workflow_id.as_deref() {
                if current != workflow_id {
                    tracing::info!(
                        from = current,
                        to = workflow_id,
                        "replacing workflow sync session"
                    );
                    state.workflow = None;
                    state.last_synced_at = None;
                }
            }

            state.generation += 1;
            state.workflow_id = Some(workflow_id.to_string());
            state.error = None;
            state.stalled = false;
            let session = self.core.spawn_poller(workflow_id, state.generation);
            state.polling = true;
            let previous = state.session.replace(session);
            self.core.set_phase(state, SyncPhase::Syncing);
            self.core.publish(state);
            previous
        };

        drop(previous);
        Ok(())
    }

    /// Stops syncing. Keeps the last workflow and error for display.
    pub fn stop(&self) {
        let session = {
            let mut state = self.core.lock_state();
            state.generation += 1;
            state.polling = false;
            state.stalled = false;
            let session = state.session.take();
            self.core.set_phase(&mut state, SyncPhase::Idle);
            self.core.publish(&state);
            session
        };
        drop(session);
    }

    /// Fetches immediately, outside the regular cadence.
    ///
    /// Waits for a timer fetch that is already in flight, then performs its
    /// own. A successful fetch of a non-terminal workflow resumes polling if it
    /// had stopped on an error. Transport failures are reported on the
    /// returned snapshot, not as `Err`.
    pub async fn force_sync(&self) -> Result<SyncSnapshot, SyncError> {
        let (workflow_id, generation) = {
            let state = self.core.lock_state();
            match (&state.phase, &state.workflow_id) {
                (SyncPhase::Idle, _) | (_, None) => return Err(SyncError::NotStarted),
                (_, Some(id)) => (id.clone(), state.generation),
            }
        };

        let _gate = self.core.fetch_gate.lock().await;
        if self.core.lock_state().generation != generation {
            return Err(SyncError::Superseded);
        }

        tracing::debug!(workflow_id = %workflow_id, "forced sync");
        let result = self.core.fetch(&workflow_id, generation).await;

        let (applied, retired) = match result {
            Ok(workflow) => self.core.apply_success(generation, workflow, true),
            Err(error) => self.core.apply_failure(generation, error, true),
        };
        drop(retired);

        if applied == Applied::Stale {
            return Err(SyncError::Superseded);
        }
        Ok(self.snapshot())
    }

    /// Current snapshot. Side-effect free.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.core.snapshot_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.core.snapshot_tx.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        self.core.lock_state().phase
    }

    pub fn workflow_id(&self) -> Option<String> {
        self.core.lock_state().workflow_id.clone()
    }

    pub fn transport(&self) -> Arc<dyn WorkflowTransport> {
        Arc::clone(&self.core.transport)
    }

    pub fn events(&self) -> EventSink {
        self.core.events.clone()
    }
}

impl Drop for WorkflowSyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Core {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interval(&self) -> Duration {
        self.config.workflow_interval()
    }

    fn spawn_poller(self: &Arc<Self>, workflow_id: &str, generation: u64) -> PollSession {
        let fetch_core = Arc::downgrade(self);
        let result_core = Arc::downgrade(self);
        let error_core = Arc::downgrade(self);
        let workflow_id = workflow_id.to_string();

        StatusPoller::start(
            move || {
                let core = fetch_core.upgrade();
                let workflow_id = workflow_id.clone();
                async move {
                    let Some(core) = core else {
                        return Err(SyncError::Superseded);
                    };
                    let Ok(_gate) = core.fetch_gate.try_lock() else {
                        tracing::debug!(workflow_id = %workflow_id, "forced sync in flight, skipping tick");
                        return Ok(None);
                    };
                    core.fetch(&workflow_id, generation).await.map(Some)
                }
            },
            self.interval(),
            move |outcome: Option<Workflow>| {
                let Some(core) = result_core.upgrade() else {
                    return ControlFlow::Break(());
                };
                match outcome {
                    None => ControlFlow::Continue(()),
                    Some(workflow) => core.apply_success(generation, workflow, false).0.flow(),
                }
            },
            move |error: SyncError| {
                let Some(core) = error_core.upgrade() else {
                    return ControlFlow::Break(());
                };
                core.apply_failure(generation, error, false).0.flow()
            },
        )
    }

    /// Fetches the workflow, flagging the session as stalled if the request
    /// outlives the stall threshold. A stall never aborts the request.
    async fn fetch(&self, workflow_id: &str, generation: u64) -> Result<Workflow, SyncError> {
        let mut request = self.transport.fetch_workflow_status(workflow_id);
        let result = match self.config.stall_after(self.interval()) {
            None => request.await,
            Some(threshold) => match tokio::time::timeout(threshold, &mut request).await {
                Ok(result) => result,
                Err(_) => {
                    self.mark_stalled(generation, threshold);
                    request.await
                }
            },
        };
        result.map_err(SyncError::from)
    }

    fn mark_stalled(&self, generation: u64, waited: Duration) {
        let mut state = self.lock_state();
        if state.generation != generation || state.stalled {
            return;
        }
        state.stalled = true;
        let subject = state.workflow_id.clone().unwrap_or_default();
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(
            workflow_id = %subject,
            waited_ms,
            "workflow status fetch is stalled"
        );
        self.events.emit(
            COMPONENT,
            SyncEvent::Stalled {
                subject,
                waited_ms,
            },
        );
        self.publish(&state);
    }

    /// Applies a fetched workflow. Returns a session that must be dropped
    /// after the state lock is released, if one was retired.
    fn apply_success(
        self: &Arc<Self>,
        generation: u64,
        workflow: Workflow,
        forced: bool,
    ) -> (Applied, Option<PollSession>) {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase == SyncPhase::Idle {
            tracing::debug!(workflow_id = %workflow.id, "dropping result of a stopped session");
            return (Applied::Stale, None);
        }

        for violation in workflow.invariant_violations() {
            tracing::warn!(workflow_id = %workflow.id, "{}", violation);
        }

        self.emit_changes(state.workflow.as_deref(), &workflow);

        let terminal = workflow.status.is_terminal();
        state.workflow = Some(Arc::new(workflow));
        state.error = None;
        state.stalled = false;
        state.last_synced_at = Some(Utc::now());
        state.sync_count += 1;

        let mut retired = None;
        let applied = if terminal {
            if forced {
                retired = state.session.take();
            }
            state.polling = false;
            self.set_phase(&mut state, SyncPhase::Settled);
            Applied::Settled
        } else {
            if forced && !state.polling {
                // Resume after an error or an unexpected post-terminal update.
                let id = state.workflow_id.clone().unwrap_or_default();
                let session = self.spawn_poller(&id, generation);
                retired = state.session.replace(session);
                state.polling = true;
            }
            self.set_phase(&mut state, SyncPhase::Syncing);
            Applied::Continue
        };

        self.publish(&state);
        (applied, retired)
    }

    /// Records a failed fetch. Workflow status errors always end the session:
    /// the client cannot tell whether the workflow is still active.
    fn apply_failure(
        &self,
        generation: u64,
        error: SyncError,
        forced: bool,
    ) -> (Applied, Option<PollSession>) {
        if error == SyncError::Superseded {
            return (Applied::Stale, None);
        }

        let mut state = self.lock_state();
        if state.generation != generation || state.phase == SyncPhase::Idle {
            return (Applied::Stale, None);
        }

        let subject = state.workflow_id.clone().unwrap_or_default();
        tracing::warn!(workflow_id = %subject, error = %error, "workflow sync failed");
        self.events.emit(
            COMPONENT,
            SyncEvent::SyncFailed {
                subject,
                error: error.to_string(),
            },
        );

        state.error = Some(error);
        state.stalled = false;
        state.polling = false;
        let retired = if forced { state.session.take() } else { None };
        self.set_phase(&mut state, SyncPhase::Errored);
        self.publish(&state);
        (Applied::Errored, retired)
    }

    fn emit_changes(&self, previous: Option<&Workflow>, next: &Workflow) {
        let changed = match previous {
            None => true,
            Some(p) => p.status != next.status || p.current_step_number != next.current_step_number,
        };
        if changed {
            tracing::info!(
                workflow_id = %next.id,
                status = %next.status,
                step = next.current_step_number,
                "workflow updated"
            );
            self.events.emit(
                COMPONENT,
                SyncEvent::WorkflowUpdated {
                    workflow_id: next.id.clone(),
                    status: next.status,
                    current_step_number: next.current_step_number,
                },
            );
        }

        let before = previous.map(compute_interaction);
        let after = compute_interaction(next);
        let before_kind = before.as_ref().map(|i| i.kind());
        let before_step = before.as_ref().and_then(|i| i.step_id().map(str::to_string));
        if before_kind != Some(after.kind()) || before_step.as_deref() != after.step_id() {
            self.events.emit(
                COMPONENT,
                SyncEvent::InteractionChanged {
                    workflow_id: next.id.clone(),
                    from: before_kind.unwrap_or(InteractionKind::None),
                    to: after.kind(),
                    step_id: after.step_id().map(str::to_string),
                },
            );
        }
    }

    fn set_phase(&self, state: &mut EngineState, to: SyncPhase) {
        let from = state.phase;
        if from == to {
            return;
        }
        state.phase = to;
        let subject = state.workflow_id.clone().unwrap_or_default();
        tracing::info!(workflow_id = %subject, ?from, ?to, "sync phase changed");
        self.events
            .emit(COMPONENT, SyncEvent::PhaseChanged { subject, from, to });
    }

    fn publish(&self, state: &EngineState) {
        let snapshot = SyncSnapshot::build(
            state.phase,
            state.workflow_id.clone(),
            state.workflow.clone(),
            state.error.clone(),
            state.stalled,
            state.last_synced_at,
            state.sync_count,
        );
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests;
