//! Incremental agent status stream.
//!
//! Polls `fetch_agent_status` with the last seen timestamp as cursor and merges
//! every batch into a deduplicated, append-only message list. Unlike workflow
//! sync, transient transport errors do not end the stream; only a terminal
//! error, a server-reported error or completion does.

use super::events::{EventSink, SyncEvent};
use super::snapshot::{AgentStatusSnapshot, SyncPhase};
use crate::config::SyncConfig;
use crate::errors::{SyncError, TransportError};
use crate::merger::merge_messages;
use crate::model::{AgentStatusBatch, StatusMessage};
use crate::poller::{PollSession, StatusPoller};
use crate::transport::WorkflowTransport;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

const COMPONENT: &str = "AgentStatusSync";

/// Follows the status stream of one agent session at a time.
pub struct AgentStatusSync {
    core: Arc<Core>,
}

struct Core {
    transport: Arc<dyn WorkflowTransport>,
    config: SyncConfig,
    state: Mutex<StreamState>,
    snapshot_tx: watch::Sender<AgentStatusSnapshot>,
    events: EventSink,
}

struct StreamState {
    phase: SyncPhase,
    session_id: Option<String>,
    generation: u64,
    messages: Arc<Vec<StatusMessage>>,
    cursor: Option<String>,
    completed: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
    session: Option<PollSession>,
}

impl AgentStatusSync {
    pub fn new(transport: Arc<dyn WorkflowTransport>, config: SyncConfig) -> Self {
        Self::with_events(transport, config, EventSink::default())
    }

    pub fn with_events(
        transport: Arc<dyn WorkflowTransport>,
        config: SyncConfig,
        events: EventSink,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(AgentStatusSnapshot::idle());
        Self {
            core: Arc::new(Core {
                transport,
                config,
                state: Mutex::new(StreamState {
                    phase: SyncPhase::Idle,
                    session_id: None,
                    generation: 0,
                    messages: Arc::new(Vec::new()),
                    cursor: None,
                    completed: false,
                    result: None,
                    error: None,
                    session: None,
                }),
                snapshot_tx,
                events,
            }),
        }
    }

    /// Starts following `session_id` from the beginning of its stream.
    ///
    /// Restarting the session that is already `Syncing` is a no-op; any other
    /// start discards the previous messages. Must be called inside a tokio
    /// runtime.
    pub fn start(&self, session_id: &str) -> Result<(), SyncError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(SyncError::InvalidWorkflowId);
        }

        let previous = {
            let mut guard = self.core.lock_state();
            let state = &mut *guard;
            if state.phase == SyncPhase::Syncing && state.session_id.as_deref() == Some(session_id)
            {
                return Ok(());
            }

            state.generation += 1;
            state.session_id = Some(session_id.to_string());
            state.messages = Arc::new(Vec::new());
            state.cursor = None;
            state.completed = false;
            state.result = None;
            state.error = None;
            let session = self.core.spawn_poller(session_id, state.generation);
            let previous = state.session.replace(session);
            self.core.set_phase(state, SyncPhase::Syncing);
            self.core.publish(state);
            previous
        };

        drop(previous);
        Ok(())
    }

    /// Stops following the stream. Messages received so far are kept.
    pub fn stop(&self) {
        let session = {
            let mut state = self.core.lock_state();
            state.generation += 1;
            let session = state.session.take();
            self.core.set_phase(&mut state, SyncPhase::Idle);
            self.core.publish(&state);
            session
        };
        drop(session);
    }

    pub fn snapshot(&self) -> AgentStatusSnapshot {
        self.core.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatusSnapshot> {
        self.core.snapshot_tx.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        self.core.lock_state().phase
    }
}

impl Drop for AgentStatusSync {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Core {
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_poller(self: &Arc<Self>, session_id: &str, generation: u64) -> PollSession {
        let fetch_core = Arc::downgrade(self);
        let result_core = Arc::downgrade(self);
        let error_core = Arc::downgrade(self);
        let session_id = session_id.to_string();

        StatusPoller::start(
            move || {
                let core = fetch_core.upgrade();
                let session_id = session_id.clone();
                async move {
                    let Some(core) = core else {
                        return Err(SyncError::Superseded);
                    };
                    let cursor = {
                        let state = core.lock_state();
                        if state.generation != generation {
                            return Err(SyncError::Superseded);
                        }
                        state.cursor.clone()
                    };
                    core.transport
                        .fetch_agent_status(&session_id, cursor.as_deref())
                        .await
                        .map_err(SyncError::from)
                }
            },
            self.config.agent_interval(),
            move |batch: AgentStatusBatch| match result_core.upgrade() {
                Some(core) => core.apply_batch(generation, batch),
                None => ControlFlow::Break(()),
            },
            move |error: SyncError| match error_core.upgrade() {
                Some(core) => core.apply_failure(generation, error),
                None => ControlFlow::Break(()),
            },
        )
    }

    fn apply_batch(&self, generation: u64, batch: AgentStatusBatch) -> ControlFlow<()> {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase == SyncPhase::Idle {
            return ControlFlow::Break(());
        }
        let subject = state.session_id.clone().unwrap_or_default();

        let outcome = merge_messages(&state.messages, &batch.statuses);
        let added = outcome.merged.len() - state.messages.len();
        if added > 0 {
            tracing::debug!(session_id = %subject, added, "agent status messages merged");
            self.events.emit(
                COMPONENT,
                SyncEvent::MessagesMerged {
                    session_id: subject.clone(),
                    added,
                    cursor: outcome.cursor.clone(),
                },
            );
            state.messages = Arc::new(outcome.merged);
        }
        state.cursor = outcome.cursor;

        let flow = if let Some(error) = batch.error {
            tracing::warn!(session_id = %subject, error = %error, "agent reported an error");
            self.events.emit(
                COMPONENT,
                SyncEvent::SyncFailed {
                    subject,
                    error: error.clone(),
                },
            );
            state.error = Some(error);
            self.set_phase(&mut state, SyncPhase::Errored);
            ControlFlow::Break(())
        } else if batch.completed {
            state.completed = true;
            state.result = batch.result;
            state.error = None;
            self.set_phase(&mut state, SyncPhase::Settled);
            ControlFlow::Break(())
        } else {
            state.error = None;
            ControlFlow::Continue(())
        };

        self.publish(&state);
        flow
    }

    /// Transient failures are recorded and polling continues. Terminal ones
    /// end the stream.
    fn apply_failure(&self, generation: u64, error: SyncError) -> ControlFlow<()> {
        let transport_error = match error {
            SyncError::Transport(e) => e,
            SyncError::Superseded => return ControlFlow::Break(()),
            other => TransportError::Network {
                message: other.to_string(),
            },
        };

        let mut state = self.lock_state();
        if state.generation != generation || state.phase == SyncPhase::Idle {
            return ControlFlow::Break(());
        }

        let subject = state.session_id.clone().unwrap_or_default();
        let terminal = transport_error.is_terminal();
        tracing::warn!(
            session_id = %subject,
            error = %transport_error,
            terminal,
            "agent status fetch failed"
        );
        self.events.emit(
            COMPONENT,
            SyncEvent::SyncFailed {
                subject,
                error: transport_error.to_string(),
            },
        );

        state.error = Some(transport_error.to_string());
        let flow = if terminal {
            self.set_phase(&mut state, SyncPhase::Errored);
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        };
        self.publish(&state);
        flow
    }

    fn set_phase(&self, state: &mut StreamState, to: SyncPhase) {
        let from = state.phase;
        if from == to {
            return;
        }
        state.phase = to;
        let subject = state.session_id.clone().unwrap_or_default();
        tracing::info!(session_id = %subject, ?from, ?to, "agent status phase changed");
        self.events
            .emit(COMPONENT, SyncEvent::PhaseChanged { subject, from, to });
    }

    fn publish(&self, state: &StreamState) {
        self.snapshot_tx.send_replace(AgentStatusSnapshot {
            phase: state.phase,
            session_id: state.session_id.clone(),
            messages: Arc::clone(&state.messages),
            cursor: state.cursor.clone(),
            completed: state.completed,
            result: state.result.clone(),
            error: state.error.clone(),
        });
    }
}
