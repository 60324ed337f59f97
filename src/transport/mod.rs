//! Transport seam between the sync core and the workflow service.
//!
//! The core only depends on `WorkflowTransport`. `HttpTransport` is the
//! production implementation; tests script the trait directly.

mod http;

pub use http::HttpTransport;

use crate::errors::TransportError;
use crate::model::{AgentStatusBatch, EmailDetails, Workflow};
use async_trait::async_trait;

/// Operations the sync core consumes from the service.
///
/// Mutating calls report success or failure only; the core never interprets
/// their response bodies beyond error extraction.
#[async_trait]
pub trait WorkflowTransport: Send + Sync {
    /// Full workflow state. Replaces the local aggregate wholesale.
    async fn fetch_workflow_status(&self, workflow_id: &str) -> Result<Workflow, TransportError>;

    /// Status messages newer than `since` (all of them when `None`).
    async fn fetch_agent_status(
        &self,
        session_id: &str,
        since: Option<&str>,
    ) -> Result<AgentStatusBatch, TransportError>;

    async fn confirm_step(&self, workflow_id: &str, confirmed: bool) -> Result<(), TransportError>;

    async fn send_email(&self, step_id: &str) -> Result<(), TransportError>;

    async fn reject_email(&self, step_id: &str) -> Result<(), TransportError>;

    async fn select_job(&self, workflow_id: &str, selected_key: &str) -> Result<(), TransportError>;

    async fn inject_user_context(&self, workflow_id: &str) -> Result<(), TransportError>;

    /// Email preview for a confirmation step; the body may be truncated.
    async fn get_step_email(&self, step_id: &str) -> Result<EmailDetails, TransportError>;

    /// Untruncated email body, fetched only on request.
    async fn get_step_email_body(&self, step_id: &str) -> Result<String, TransportError>;
}
