//! Wire and domain types for workflows, steps and agent status messages.
//!
//! Field names follow the service's camelCase JSON; status enums are snake_case.
//! The server is the only source of truth for these values. The client
//! replaces a `Workflow` wholesale on every fetch and never edits it in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a workflow as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Running,
    WaitingUserInput,
    WaitingConfirmation,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses never change again; polling stops once one is seen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses that keep a sync session polling.
    pub fn keeps_polling(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::WaitingUserInput => "waiting_user_input",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    PendingConfirmation,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work inside a workflow. Owned exclusively by its `Workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    /// 1-based, unique within the workflow, equal to position + 1.
    pub step_number: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Tool-specific payload. Shape depends on `tool_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Server-tracked multi-step execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub status: WorkflowStatus,
    /// 1-based index of the step currently eligible for action.
    pub current_step_number: u32,
    /// Execution order. Never reordered by the client.
    #[serde(default)]
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// The step `current_step_number` points at, if it exists.
    pub fn current_step(&self) -> Option<&Step> {
        let index = usize::try_from(self.current_step_number.checked_sub(1)?).ok()?;
        self.steps.get(index)
    }

    pub fn step_by_id(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Lists invariant violations in the payload. The client never rejects a
    /// workflow for these; they are logged so service bugs stay visible.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for (index, step) in self.steps.iter().enumerate() {
            let expected = index + 1;
            if usize::try_from(step.step_number).ok() != Some(expected) {
                violations.push(format!(
                    "step {} has stepNumber {} at position {}",
                    step.id, step.step_number, expected
                ));
            }
        }

        let running = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count();
        if running > 1 {
            violations.push(format!("{} steps report status running", running));
        }

        if !self.status.is_terminal() && !self.steps.is_empty() && self.current_step().is_none() {
            violations.push(format!(
                "currentStepNumber {} is outside 1..={}",
                self.current_step_number,
                self.steps.len()
            ));
        }

        violations
    }
}

/// One entry of the agent status stream.
///
/// Two messages are the same message iff both `timestamp` and `message` match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusMessage {
    /// ISO-8601 timestamp, used verbatim as the stream cursor.
    pub timestamp: String,
    pub message: String,
}

impl StatusMessage {
    pub fn new(timestamp: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            message: message.into(),
        }
    }
}

/// Response of an incremental agent status fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusBatch {
    #[serde(default)]
    pub statuses: Vec<StatusMessage>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// File attached to a pending email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Content of an email waiting for confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailDetails {
    #[serde(deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// True when `body` is a preview; the full body is fetched on demand.
    #[serde(default)]
    pub body_truncated: bool,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

impl EmailDetails {
    /// Reads email details embedded in a step result, if the tool put them there.
    pub fn from_step_result(result: &serde_json::Value) -> Option<Self> {
        let candidate = result.get("email").unwrap_or(result);
        candidate.get("to")?;
        serde_json::from_value(candidate.clone()).ok()
    }
}

/// One named option of a job-selection step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCandidate {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl JobCandidate {
    /// Reads the `candidates` array of a job-selection step result.
    ///
    /// Accepts plain strings (key doubles as label) or `{key, label, summary}`
    /// objects. Entries without a usable key are skipped.
    pub fn list_from_step_result(result: &serde_json::Value) -> Vec<Self> {
        let Some(items) = result.get("candidates").and_then(|c| c.as_array()) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(key) => Some(Self {
                    key: key.clone(),
                    label: key.clone(),
                    summary: None,
                }),
                serde_json::Value::Object(_) => {
                    let mut candidate: Self = serde_json::from_value(item.clone()).ok()?;
                    if candidate.label.is_empty() {
                        candidate.label = candidate.key.clone();
                    }
                    Some(candidate)
                }
                _ => None,
            })
            .collect()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
        OneOrMany::Null(()) => Vec::new(),
    })
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
