use super::*;
use crate::errors::TransportError;
use crate::interaction::Interaction;
use crate::model::{AgentStatusBatch, StatusMessage, WorkflowStatus};
use crate::test_support::{completed, email_waiting, running, wait_for, Call, MockTransport};
use std::time::Duration;

fn config(interval_ms: u64, stall_factor: u32) -> SyncConfig {
    SyncConfig {
        workflow_interval_ms: interval_ms,
        agent_interval_ms: 2000,
        stall_factor,
    }
}

fn engine(mock: &Arc<MockTransport>, config: SyncConfig) -> WorkflowSyncEngine {
    WorkflowSyncEngine::new(Arc::clone(mock) as Arc<dyn WorkflowTransport>, config)
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_settles_and_stops_polling_on_terminal_status() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.push_workflow(completed("wf-1"));
    let engine = engine(&mock, config(1000, 0));
    let mut rx = engine.subscribe();

    engine.start("wf-1").unwrap();
    let settled = wait_for(&mut rx, |s| s.phase == SyncPhase::Settled).await;

    assert_eq!(settled.workflow.as_ref().unwrap().status, WorkflowStatus::Completed);
    assert_eq!(settled.sync_count, 2);
    assert!(settled.interaction.is_none());

    advance(20_000).await;
    assert_eq!(mock.workflow_fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_first_fetch_is_immediate_and_cadence_follows_completion() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.set_fetch_delay(Duration::from_millis(500));
    let engine = engine(&mock, config(1000, 0));

    engine.start("wf-1").unwrap();
    advance(1).await;
    assert_eq!(mock.workflow_fetches(), 1);

    // 0..500 fetch, 500..1500 wait, 1500..2000 fetch, 2000..3000 wait
    advance(1600).await;
    assert_eq!(mock.workflow_fetches(), 2);
    advance(1500).await;
    assert_eq!(mock.workflow_fetches(), 3);
    assert_eq!(mock.max_fetches_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_result() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.set_fetch_delay(Duration::from_millis(1000));
    let engine = engine(&mock, config(1000, 0));

    engine.start("wf-1").unwrap();
    advance(100).await;
    engine.stop();
    advance(10_000).await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Idle);
    assert!(snapshot.workflow.is_none());
    assert_eq!(snapshot.sync_count, 0);
    assert_eq!(mock.workflow_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_keeps_last_workflow_and_stops() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.push_workflow_error(
        "wf-1",
        TransportError::Http {
            status: 500,
            message: "boom".to_string(),
        },
    );
    let engine = engine(&mock, config(1000, 0));
    let mut rx = engine.subscribe();

    engine.start("wf-1").unwrap();
    let errored = wait_for(&mut rx, |s| s.phase == SyncPhase::Errored).await;

    assert_eq!(errored.workflow.as_ref().unwrap().status, WorkflowStatus::Running);
    assert_eq!(errored.error_message().unwrap(), "HTTP 500: boom");
    advance(10_000).await;
    assert_eq!(mock.workflow_fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_forced_sync_coalesces_with_timer_fetch() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.set_fetch_delay(Duration::from_millis(2500));
    let engine = Arc::new(engine(&mock, config(1000, 0)));

    engine.start("wf-1").unwrap();
    advance(2600).await;
    assert_eq!(mock.workflow_fetches(), 1);

    let forced = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.force_sync().await })
    };

    // Forced fetch runs 2600..5100; timer ticks at 3500 and 4500 skip.
    advance(2400).await;
    assert_eq!(mock.workflow_fetches(), 2);
    assert_eq!(mock.max_fetches_in_flight(), 1);

    let snapshot = forced.await.unwrap().unwrap();
    assert_eq!(snapshot.sync_count, 2);
    assert_eq!(snapshot.phase, SyncPhase::Syncing);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_forced_sync() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.push_workflow(completed("wf-1"));
    let engine = Arc::new(engine(&mock, config(60_000, 0)));
    let mut rx = engine.subscribe();
    engine.start("wf-1").unwrap();
    wait_for(&mut rx, |s| s.sync_count == 1).await;

    mock.set_fetch_delay(Duration::from_millis(1000));
    let forced = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.force_sync().await })
    };
    advance(500).await;
    engine.stop();

    assert_eq!(forced.await.unwrap().unwrap_err(), SyncError::Superseded);
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.phase, SyncPhase::Idle);
    assert_eq!(snapshot.sync_count, 1);
    assert_eq!(snapshot.workflow.as_ref().unwrap().status, WorkflowStatus::Running);
    assert_eq!(mock.workflow_fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_requires_started_session() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock, config(1000, 0));

    assert_eq!(engine.force_sync().await.unwrap_err(), SyncError::NotStarted);
    assert_eq!(engine.start("  ").unwrap_err(), SyncError::InvalidWorkflowId);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_resumes_polling_after_error() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow_error(
        "wf-1",
        TransportError::Network {
            message: "connection refused".to_string(),
        },
    );
    mock.push_workflow(running("wf-1"));
    let engine = engine(&mock, config(1000, 0));
    let mut rx = engine.subscribe();

    engine.start("wf-1").unwrap();
    wait_for(&mut rx, |s| s.phase == SyncPhase::Errored).await;

    let snapshot = engine.force_sync().await.unwrap();
    assert_eq!(snapshot.phase, SyncPhase::Syncing);
    assert!(snapshot.error.is_none());

    let fetched = mock.workflow_fetches();
    advance(2500).await;
    assert!(mock.workflow_fetches() > fetched);
}

#[tokio::test(start_paused = true)]
async fn test_start_with_new_id_replaces_session() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.push_workflow(email_waiting("wf-2"));
    let engine = engine(&mock, config(1000, 0));
    let mut rx = engine.subscribe();

    engine.start("wf-1").unwrap();
    wait_for(&mut rx, |s| s.sync_count == 1).await;
    engine.start("wf-2").unwrap();
    let snapshot = wait_for(&mut rx, |s| {
        s.workflow.as_ref().is_some_and(|w| w.id == "wf-2")
    })
    .await;

    assert_eq!(snapshot.workflow_id.as_deref(), Some("wf-2"));
    assert!(matches!(
        snapshot.interaction,
        Interaction::NeedsEmailConfirmation { .. }
    ));

    let before = mock.count(|c| *c == Call::FetchWorkflow("wf-1".to_string()));
    advance(5000).await;
    assert_eq!(
        mock.count(|c| *c == Call::FetchWorkflow("wf-1".to_string())),
        before
    );
}

#[tokio::test(start_paused = true)]
async fn test_restarting_same_workflow_is_noop() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    let engine = engine(&mock, config(1000, 0));

    engine.start("wf-1").unwrap();
    engine.start("wf-1").unwrap();
    advance(1).await;

    assert_eq!(mock.workflow_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_flags_stall_until_it_completes() {
    let mock = Arc::new(MockTransport::new());
    mock.push_workflow(running("wf-1"));
    mock.set_fetch_delay(Duration::from_millis(10_000));
    let engine = engine(&mock, config(1000, 3));

    engine.start("wf-1").unwrap();
    advance(2900).await;
    assert!(!engine.snapshot().stalled);
    advance(200).await;
    assert!(engine.snapshot().stalled);
    assert_eq!(engine.snapshot().phase, SyncPhase::Syncing);

    advance(7000).await;
    let snapshot = engine.snapshot();
    assert!(!snapshot.stalled);
    assert_eq!(snapshot.sync_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_is_side_effect_free() {
    let mock = Arc::new(MockTransport::new());
    let engine = engine(&mock, config(1000, 0));

    let first = engine.snapshot();
    let second = engine.snapshot();

    assert_eq!(first.phase, SyncPhase::Idle);
    assert_eq!(second.sync_count, 0);
    assert!(mock.calls().is_empty());
}

fn agent(mock: &Arc<MockTransport>) -> AgentStatusSync {
    AgentStatusSync::new(
        Arc::clone(mock) as Arc<dyn WorkflowTransport>,
        config(1000, 0),
    )
}

fn batch(messages: &[(&str, &str)]) -> AgentStatusBatch {
    AgentStatusBatch {
        statuses: messages
            .iter()
            .map(|(ts, msg)| StatusMessage::new(*ts, *msg))
            .collect(),
        ..AgentStatusBatch::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_agent_stream_deduplicates_overlapping_batches() {
    let mock = Arc::new(MockTransport::new());
    mock.push_batch(batch(&[("T1", "m1")]));
    mock.push_batch(batch(&[("T1", "m1"), ("T2", "m2")]));
    mock.push_batch(AgentStatusBatch {
        completed: true,
        result: Some(serde_json::json!({ "ok": true })),
        ..AgentStatusBatch::default()
    });
    let stream = agent(&mock);
    let mut rx = stream.subscribe();

    stream.start("agent-1").unwrap();
    let settled = wait_for(&mut rx, |s| s.phase == SyncPhase::Settled).await;

    assert_eq!(
        *settled.messages,
        vec![StatusMessage::new("T1", "m1"), StatusMessage::new("T2", "m2")]
    );
    assert!(settled.completed);
    assert_eq!(settled.cursor.as_deref(), Some("T2"));
    assert_eq!(settled.result, Some(serde_json::json!({ "ok": true })));

    let cursors: Vec<Option<String>> = mock
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::FetchAgent { since, .. } => Some(since),
            _ => None,
        })
        .collect();
    assert_eq!(
        cursors,
        vec![None, Some("T1".to_string()), Some("T2".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_agent_stream_rides_out_network_errors() {
    let mock = Arc::new(MockTransport::new());
    mock.push_batch_error(TransportError::Network {
        message: "reset".to_string(),
    });
    mock.push_batch(batch(&[("T1", "m1")]));
    mock.push_batch(AgentStatusBatch {
        completed: true,
        ..AgentStatusBatch::default()
    });
    let stream = agent(&mock);
    let mut rx = stream.subscribe();

    stream.start("agent-1").unwrap();
    let failing = wait_for(&mut rx, |s| s.error.is_some()).await;
    assert_eq!(failing.phase, SyncPhase::Syncing);

    let settled = wait_for(&mut rx, |s| s.phase == SyncPhase::Settled).await;
    assert!(settled.error.is_none());
    assert_eq!(settled.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_agent_stream_stops_on_unauthorized() {
    let mock = Arc::new(MockTransport::new());
    mock.push_batch_error(TransportError::Unauthorized);
    let stream = agent(&mock);
    let mut rx = stream.subscribe();

    stream.start("agent-1").unwrap();
    let errored = wait_for(&mut rx, |s| s.phase == SyncPhase::Errored).await;
    assert!(errored.error.unwrap().contains("unauthorized"));

    advance(20_000).await;
    assert_eq!(mock.count(|c| matches!(c, Call::FetchAgent { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_agent_reported_error_ends_stream() {
    let mock = Arc::new(MockTransport::new());
    mock.push_batch(AgentStatusBatch {
        statuses: vec![StatusMessage::new("T1", "m1")],
        error: Some("agent crashed".to_string()),
        ..AgentStatusBatch::default()
    });
    let stream = agent(&mock);
    let mut rx = stream.subscribe();

    stream.start("agent-1").unwrap();
    let errored = wait_for(&mut rx, |s| s.phase == SyncPhase::Errored).await;

    assert_eq!(errored.error.as_deref(), Some("agent crashed"));
    assert_eq!(errored.messages.len(), 1);
}
