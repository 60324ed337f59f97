//! Derivation of the single action currently required from the user.
//!
//! `compute_interaction` is the only place that looks at tool names. Everything
//! downstream matches on the `Interaction` enum.

use crate::model::{EmailDetails, JobCandidate, Step, StepStatus, Workflow, WorkflowStatus};
use serde::Serialize;

/// Closed classification of a step's tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Email,
    JobSelection,
    Other,
}

impl ToolKind {
    pub fn classify(tool_name: Option<&str>) -> Self {
        let Some(name) = tool_name else {
            return Self::Other;
        };
        let name = name.to_ascii_lowercase();

        match name.as_str() {
            "send_email" | "email_send" | "gmail_send" => return Self::Email,
            "select_job" | "job_selection" | "choose_job" => return Self::JobSelection,
            _ => {}
        }

        let mentions_mail = name.contains("email") || name.contains("mail");
        if mentions_mail && name.contains("send") {
            return Self::Email;
        }
        if name.contains("job") && (name.contains("select") || name.contains("choose")) {
            return Self::JobSelection;
        }
        Self::Other
    }

    pub fn of(step: &Step) -> Self {
        Self::classify(step.tool_name.as_deref())
    }
}

/// What the user has to do right now. Recomputed from scratch on every sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interaction {
    None,
    /// The workflow needs access to protected user context.
    NeedsUserContext {
        workflow_id: String,
        step_id: String,
        step_number: u32,
    },
    /// An email is drafted and waits for send/reject. `email_details` is
    /// `None` until hydrated when the workflow payload does not embed it.
    NeedsEmailConfirmation {
        step_id: String,
        step_number: u32,
        email_details: Option<EmailDetails>,
    },
    /// A decision step waits for one of several named options.
    NeedsJobSelection {
        step_id: String,
        step_number: u32,
        candidates: Vec<JobCandidate>,
    },
}

/// Fieldless tag of an `Interaction`, for logging and comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    None,
    UserContext,
    EmailConfirmation,
    JobSelection,
}

impl Interaction {
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::None => InteractionKind::None,
            Self::NeedsUserContext { .. } => InteractionKind::UserContext,
            Self::NeedsEmailConfirmation { .. } => InteractionKind::EmailConfirmation,
            Self::NeedsJobSelection { .. } => InteractionKind::JobSelection,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Step the interaction pertains to.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::NeedsUserContext { step_id, .. }
            | Self::NeedsEmailConfirmation { step_id, .. }
            | Self::NeedsJobSelection { step_id, .. } => Some(step_id),
        }
    }

    pub fn candidate_keys(&self) -> Vec<String> {
        match self {
            Self::NeedsJobSelection { candidates, .. } => {
                candidates.iter().map(|c| c.key.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Derives the interaction for `workflow`.
///
/// Pure. Terminal workflows, workflows without steps and workflows whose
/// `current_step_number` points nowhere all yield `Interaction::None`.
pub fn compute_interaction(workflow: &Workflow) -> Interaction {
    if workflow.status.is_terminal() {
        return Interaction::None;
    }
    let Some(step) = workflow.current_step() else {
        return Interaction::None;
    };

    if workflow.status == WorkflowStatus::WaitingUserInput {
        return Interaction::NeedsUserContext {
            workflow_id: workflow.id.clone(),
            step_id: step.id.clone(),
            step_number: step.step_number,
        };
    }

    match ToolKind::of(step) {
        ToolKind::Email if workflow.status == WorkflowStatus::WaitingConfirmation => {
            Interaction::NeedsEmailConfirmation {
                step_id: step.id.clone(),
                step_number: step.step_number,
                email_details: step.result.as_ref().and_then(EmailDetails::from_step_result),
            }
        }
        ToolKind::JobSelection if awaits_decision(workflow, step) => {
            let candidates = step
                .result
                .as_ref()
                .map(JobCandidate::list_from_step_result)
                .unwrap_or_default();
            if candidates.is_empty() {
                Interaction::None
            } else {
                Interaction::NeedsJobSelection {
                    step_id: step.id.clone(),
                    step_number: step.step_number,
                    candidates,
                }
            }
        }
        _ => Interaction::None,
    }
}

/// True when the workflow is paused on `step` for a confirmation-style answer.
pub fn awaits_decision(workflow: &Workflow, step: &Step) -> bool {
    workflow.status == WorkflowStatus::WaitingConfirmation
        || step.status == StepStatus::PendingConfirmation
}

#[cfg(test)]
#[path = "tests/interaction_tests.rs"]
mod tests;
