use super::*;
use crate::test_support::{completed, email_waiting, job_waiting, running, step, workflow};
use serde_json::json;

#[test]
fn test_email_step_waiting_confirmation() {
    let interaction = compute_interaction(&email_waiting("wf-1"));

    assert_eq!(
        interaction,
        Interaction::NeedsEmailConfirmation {
            step_id: "s2".to_string(),
            step_number: 2,
            email_details: None,
        }
    );
    assert_eq!(interaction.kind(), InteractionKind::EmailConfirmation);
}

#[test]
fn test_embedded_email_is_carried() {
    let mut wf = email_waiting("wf-1");
    wf.steps[1].result = Some(json!({ "email": { "to": "a@example.com", "subject": "Hi" } }));

    let Interaction::NeedsEmailConfirmation { email_details, .. } = compute_interaction(&wf) else {
        panic!("expected email confirmation");
    };
    assert_eq!(email_details.unwrap().subject, "Hi");
}

#[test]
fn test_user_context_wins_over_tool_kind() {
    let wf = workflow(
        "wf-1",
        WorkflowStatus::WaitingUserInput,
        1,
        vec![step("s1", 1, StepStatus::Pending, Some("send_email"))],
    );

    assert_eq!(
        compute_interaction(&wf),
        Interaction::NeedsUserContext {
            workflow_id: "wf-1".to_string(),
            step_id: "s1".to_string(),
            step_number: 1,
        }
    );
}

#[test]
fn test_job_selection_lists_candidates() {
    let interaction = compute_interaction(&job_waiting("wf-1"));

    assert_eq!(interaction.kind(), InteractionKind::JobSelection);
    assert_eq!(interaction.step_id(), Some("s3"));
    assert_eq!(interaction.candidate_keys(), vec!["A".to_string(), "B".to_string()]);
}

#[test]
fn test_job_selection_without_candidates_is_none() {
    let mut wf = job_waiting("wf-1");
    wf.steps[0].result = Some(json!({ "candidates": [] }));

    assert!(compute_interaction(&wf).is_none());
}

#[test]
fn test_job_selection_on_pending_step_while_running() {
    let mut wf = job_waiting("wf-1");
    wf.status = WorkflowStatus::Running;

    assert_eq!(compute_interaction(&wf).kind(), InteractionKind::JobSelection);

    wf.steps[0].status = StepStatus::Running;
    assert!(compute_interaction(&wf).is_none());
}

#[test]
fn test_no_interaction_cases() {
    assert!(compute_interaction(&running("wf-1")).is_none());
    assert!(compute_interaction(&completed("wf-1")).is_none());

    let empty = workflow("wf-1", WorkflowStatus::WaitingConfirmation, 1, Vec::new());
    assert!(compute_interaction(&empty).is_none());

    let mut out_of_range = email_waiting("wf-1");
    out_of_range.current_step_number = 9;
    assert!(compute_interaction(&out_of_range).is_none());

    // Email tool that is not waiting for confirmation.
    let mut drafting = email_waiting("wf-1");
    drafting.status = WorkflowStatus::Running;
    assert!(compute_interaction(&drafting).is_none());
}

#[test]
fn test_terminal_workflow_never_asks() {
    let mut wf = email_waiting("wf-1");
    wf.status = WorkflowStatus::Cancelled;

    assert!(compute_interaction(&wf).is_none());
}

#[test]
fn test_tool_classification() {
    assert_eq!(ToolKind::classify(Some("send_email")), ToolKind::Email);
    assert_eq!(ToolKind::classify(Some("Gmail_Send")), ToolKind::Email);
    assert_eq!(ToolKind::classify(Some("outlook_send_mail")), ToolKind::Email);
    assert_eq!(ToolKind::classify(Some("read_email")), ToolKind::Other);
    assert_eq!(ToolKind::classify(Some("select_job")), ToolKind::JobSelection);
    assert_eq!(ToolKind::classify(Some("choose_job_posting")), ToolKind::JobSelection);
    assert_eq!(ToolKind::classify(Some("job_search")), ToolKind::Other);
    assert_eq!(ToolKind::classify(None), ToolKind::Other);
}

#[test]
fn test_interaction_serializes_with_kind_tag() {
    let value = serde_json::to_value(compute_interaction(&job_waiting("wf-1"))).unwrap();

    assert_eq!(value["kind"], "needs_job_selection");
    assert_eq!(value["candidates"][1]["key"], "B");
    assert_eq!(serde_json::to_value(Interaction::None).unwrap()["kind"], "none");
}
