//! Scripted transport and fixtures shared by unit tests.

use crate::errors::TransportError;
use crate::model::{AgentStatusBatch, EmailDetails, Step, StepStatus, Workflow, WorkflowStatus};
use crate::transport::WorkflowTransport;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

/// Every call the mock received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FetchWorkflow(String),
    FetchAgent {
        session_id: String,
        since: Option<String>,
    },
    Confirm {
        workflow_id: String,
        confirmed: bool,
    },
    SendEmail(String),
    RejectEmail(String),
    SelectJob {
        workflow_id: String,
        key: String,
    },
    InjectContext(String),
    GetEmail(String),
    GetEmailBody(String),
}

#[derive(Default)]
struct Script {
    /// Per workflow id. The last entry repeats forever.
    workflows: HashMap<String, VecDeque<Result<Workflow, TransportError>>>,
    /// Replaces the workflow queue after a successful action.
    after_action: Option<Workflow>,
    batches: VecDeque<Result<AgentStatusBatch, TransportError>>,
    fetch_delay: Duration,
    action_delay: Duration,
    action_error: Option<TransportError>,
    email: Option<Result<EmailDetails, TransportError>>,
    email_body: Option<Result<String, TransportError>>,
    calls: Vec<Call>,
    fetches_in_flight: usize,
    max_fetches_in_flight: usize,
}

/// `WorkflowTransport` that replays scripted responses and records calls.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<Script>,
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_workflow(&self, workflow: Workflow) {
        self.script()
            .workflows
            .entry(workflow.id.clone())
            .or_default()
            .push_back(Ok(workflow));
    }

    pub fn push_workflow_error(&self, workflow_id: &str, error: TransportError) {
        self.script()
            .workflows
            .entry(workflow_id.to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub fn set_after_action(&self, workflow: Workflow) {
        self.script().after_action = Some(workflow);
    }

    pub fn push_batch(&self, batch: AgentStatusBatch) {
        self.script().batches.push_back(Ok(batch));
    }

    pub fn push_batch_error(&self, error: TransportError) {
        self.script().batches.push_back(Err(error));
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.script().fetch_delay = delay;
    }

    pub fn set_action_delay(&self, delay: Duration) {
        self.script().action_delay = delay;
    }

    pub fn set_action_error(&self, error: Option<TransportError>) {
        self.script().action_error = error;
    }

    pub fn set_email(&self, email: Result<EmailDetails, TransportError>) {
        self.script().email = Some(email);
    }

    pub fn set_email_body(&self, body: Result<String, TransportError>) {
        self.script().email_body = Some(body);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.script().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn workflow_fetches(&self) -> usize {
        self.count(|c| matches!(c, Call::FetchWorkflow(_)))
    }

    pub fn action_calls(&self) -> usize {
        self.count(|c| {
            !matches!(
                c,
                Call::FetchWorkflow(_)
                    | Call::FetchAgent { .. }
                    | Call::GetEmail(_)
                    | Call::GetEmailBody(_)
            )
        })
    }

    pub fn max_fetches_in_flight(&self) -> usize {
        self.script().max_fetches_in_flight
    }

    async fn action(&self, call: Call) -> Result<(), TransportError> {
        let delay = {
            let mut script = self.script();
            script.calls.push(call);
            script.action_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if let Some(error) = script.action_error.clone() {
            return Err(error);
        }
        if let Some(workflow) = script.after_action.take() {
            let queue = script.workflows.entry(workflow.id.clone()).or_default();
            queue.clear();
            queue.push_back(Ok(workflow));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowTransport for MockTransport {
    async fn fetch_workflow_status(&self, workflow_id: &str) -> Result<Workflow, TransportError> {
        let delay = {
            let mut script = self.script();
            script.calls.push(Call::FetchWorkflow(workflow_id.to_string()));
            script.fetches_in_flight += 1;
            script.max_fetches_in_flight = script
                .max_fetches_in_flight
                .max(script.fetches_in_flight);
            script.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        script.fetches_in_flight -= 1;
        script
            .workflows
            .get_mut(workflow_id)
            .and_then(next)
            .unwrap_or(Err(TransportError::Http {
                status: 404,
                message: format!("workflow {} not found", workflow_id),
            }))
    }

    async fn fetch_agent_status(
        &self,
        session_id: &str,
        since: Option<&str>,
    ) -> Result<AgentStatusBatch, TransportError> {
        let delay = {
            let mut script = self.script();
            script.calls.push(Call::FetchAgent {
                session_id: session_id.to_string(),
                since: since.map(str::to_string),
            });
            script.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        next(&mut self.script().batches).unwrap_or_else(|| Ok(AgentStatusBatch::default()))
    }

    async fn confirm_step(&self, workflow_id: &str, confirmed: bool) -> Result<(), TransportError> {
        self.action(Call::Confirm {
            workflow_id: workflow_id.to_string(),
            confirmed,
        })
        .await
    }

    async fn send_email(&self, step_id: &str) -> Result<(), TransportError> {
        self.action(Call::SendEmail(step_id.to_string())).await
    }

    async fn reject_email(&self, step_id: &str) -> Result<(), TransportError> {
        self.action(Call::RejectEmail(step_id.to_string())).await
    }

    async fn select_job(&self, workflow_id: &str, selected_key: &str) -> Result<(), TransportError> {
        self.action(Call::SelectJob {
            workflow_id: workflow_id.to_string(),
            key: selected_key.to_string(),
        })
        .await
    }

    async fn inject_user_context(&self, workflow_id: &str) -> Result<(), TransportError> {
        self.action(Call::InjectContext(workflow_id.to_string()))
            .await
    }

    async fn get_step_email(&self, step_id: &str) -> Result<EmailDetails, TransportError> {
        let (delay, email) = {
            let mut script = self.script();
            script.calls.push(Call::GetEmail(step_id.to_string()));
            (script.fetch_delay, script.email.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        email.unwrap_or(Err(TransportError::Http {
            status: 404,
            message: "no email".to_string(),
        }))
    }

    async fn get_step_email_body(&self, step_id: &str) -> Result<String, TransportError> {
        let mut script = self.script();
        script.calls.push(Call::GetEmailBody(step_id.to_string()));
        script
            .email_body
            .clone()
            .unwrap_or(Err(TransportError::Http {
                status: 404,
                message: "no email body".to_string(),
            }))
    }
}

pub fn step(id: &str, step_number: u32, status: StepStatus, tool_name: Option<&str>) -> Step {
    Step {
        id: id.to_string(),
        step_number,
        status,
        tool_name: tool_name.map(str::to_string),
        description: format!("step {}", step_number),
        requires_confirmation: false,
        result: None,
        error_message: None,
    }
}

pub fn workflow(id: &str, status: WorkflowStatus, current_step_number: u32, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: id.to_string(),
        status,
        current_step_number,
        steps,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        completed_at: None,
    }
}

/// One-step running workflow.
pub fn running(id: &str) -> Workflow {
    workflow(
        id,
        WorkflowStatus::Running,
        1,
        vec![step("s1", 1, StepStatus::Running, Some("search"))],
    )
}

/// Same workflow after it finished.
pub fn completed(id: &str) -> Workflow {
    let mut done = workflow(
        id,
        WorkflowStatus::Completed,
        1,
        vec![step("s1", 1, StepStatus::Completed, Some("search"))],
    );
    done.completed_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    done
}

/// Workflow paused on an email step that embeds no preview.
pub fn email_waiting(id: &str) -> Workflow {
    workflow(
        id,
        WorkflowStatus::WaitingConfirmation,
        2,
        vec![
            step("s1", 1, StepStatus::Completed, Some("search")),
            step("s2", 2, StepStatus::PendingConfirmation, Some("send_email")),
        ],
    )
}

/// Workflow paused on a job selection with candidates `A` and `B`.
pub fn job_waiting(id: &str) -> Workflow {
    let mut select = step("s3", 1, StepStatus::PendingConfirmation, Some("select_job"));
    select.result = Some(serde_json::json!({ "candidates": ["A", "B"] }));
    workflow(id, WorkflowStatus::WaitingConfirmation, 1, vec![select])
}

pub fn sample_email() -> EmailDetails {
    EmailDetails {
        to: vec!["ops@example.com".to_string()],
        cc: Vec::new(),
        subject: "Weekly report".to_string(),
        body: "Hello".to_string(),
        body_truncated: true,
        attachments: Vec::new(),
    }
}

/// Waits until a published value satisfies `pred`, or panics after a minute
/// of (possibly paused) tokio time.
pub async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(pred))
        .await
        .expect("timed out waiting for snapshot")
        .expect("sender dropped")
        .clone()
}
