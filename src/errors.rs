//! Error types for transport, synchronization and resolution.
//!
//! These travel as data: sync errors land on snapshots, resolution errors are
//! returned to the caller. Nothing here is thrown across the sync boundary.

use std::fmt::{Display, Formatter};

/// Failure talking to the workflow service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection, DNS, TLS or timeout failure.
    Network { message: String },
    /// Non-success HTTP status with the message extracted from the body.
    Http { status: u16, message: String },
    /// 401 from the service. Always terminal for the client.
    Unauthorized,
    /// Response body did not match the expected shape.
    Decode { message: String },
}

impl TransportError {
    /// Terminal errors stop every kind of polling, including streams that
    /// otherwise ride out transient failures.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network { message } => write!(f, "network error: {}", message),
            Self::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            Self::Unauthorized => write!(f, "unauthorized: session expired or missing credentials"),
            Self::Decode { message } => write!(f, "unexpected response: {}", message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors from the sync engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// `start` was called with an empty id.
    InvalidWorkflowId,
    /// The operation needs an active or settled session.
    NotStarted,
    /// The session was stopped or replaced while the fetch was in flight.
    Superseded,
    Transport(TransportError),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWorkflowId => write!(f, "workflow id must not be empty"),
            Self::NotStarted => write!(f, "no sync session has been started"),
            Self::Superseded => write!(f, "sync session was stopped or replaced"),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Errors from `resolve_*` actions. None of them change the sync lifecycle;
/// the user may retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Selected key is not one of the presented candidates. Never reaches
    /// the transport.
    InvalidSelection { key: String, candidates: Vec<String> },
    /// The interaction no longer applies to the current step. Re-derive and
    /// retry against the new one.
    StaleInteraction { step_id: String, reason: String },
    /// No workflow has been loaded yet.
    NoWorkflow,
    Transport(TransportError),
}

impl Display for ResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSelection { key, candidates } => write!(
                f,
                "invalid selection '{}': expected one of [{}]",
                key,
                candidates.join(", ")
            ),
            Self::StaleInteraction { step_id, reason } => {
                write!(f, "stale interaction for step {}: {}", step_id, reason)
            }
            Self::NoWorkflow => write!(f, "no workflow loaded"),
            Self::Transport(e) => write!(f, "resolution failed: {}", e),
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ResolutionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
