//! Client-side synchronization with a remote workflow execution service.
//!
//! `WorkflowSyncEngine` polls a workflow until it settles and publishes
//! immutable `SyncSnapshot`s. `InteractionResolver` answers whatever the
//! current snapshot asks of the user, and `EmailHydrator` lazily loads email
//! previews for confirmation prompts. `AgentStatusSync` follows an agent's
//! incremental status stream. All network access goes through
//! `WorkflowTransport`.

pub mod config;
pub mod errors;
pub mod hydration;
pub mod interaction;
pub mod merger;
pub mod model;
pub mod poller;
pub mod resolver;
pub mod structured_logger;
pub mod sync_engine;
pub mod transport;
pub mod wfsync_paths;

#[cfg(test)]
mod test_support;

pub use config::{ClientConfig, SyncConfig};
pub use errors::{ResolutionError, SyncError, TransportError};
pub use hydration::{EmailHydration, EmailHydrator};
pub use interaction::{compute_interaction, Interaction, InteractionKind};
pub use resolver::{InteractionResolver, Resolution};
pub use sync_engine::{AgentStatusSync, SyncPhase, SyncSnapshot, WorkflowSyncEngine};
pub use transport::{HttpTransport, WorkflowTransport};
