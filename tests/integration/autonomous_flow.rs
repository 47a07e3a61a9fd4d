use std::sync::Arc;

use agentrunner_core::events::{Event, EventType, Payload};
use agentrunner_core::state_machine::WorkerStatus;
use agentrunner_core::test_utils::{
    autonomous_worker, event_driven_worker, probe_queue, wait_until, EchoCapability,
    FailingCapability, StaticCapabilityFactory,
};
use serde_json::json;

use crate::common::AgentSystem;

#[tokio::test]
async fn test_invoked_task_runs_in_isolated_pool_and_worker_returns_to_ready() {
    let echo = Arc::new(EchoCapability::default());
    let system = AgentSystem::start(
        vec![autonomous_worker("summarizer")],
        StaticCapabilityFactory::new().with_default(echo.clone()),
    )
    .await;
    probe_queue(&system.bus, "probe.autonomous", ["autonomous.task.#"]).await;
    system.wait_for_status("summarizer", WorkerStatus::Ready).await;
    assert_eq!(system.isolated.instance_count("summarizer"), 2);

    let execution_id = system
        .orchestrator
        .invoke("summarizer", json!({"prompt": "summarize the quarter"}))
        .await
        .expect("invocation routed");

    wait_until(|| {
        system
            .store
            .latest_execution(execution_id)
            .is_some_and(|record| record.status == "completed")
    })
    .await;
    system.wait_for_status("summarizer", WorkerStatus::Ready).await;

    assert_eq!(echo.call_count(), 1);
    assert_eq!(system.isolated.active_task_count(), 0);

    let statuses: Vec<String> = system
        .store
        .execution_records(execution_id)
        .into_iter()
        .map(|record| record.status)
        .collect();
    assert_eq!(statuses, vec!["started", "completed"]);

    wait_until(|| {
        system
            .broker
            .queued_events("probe.autonomous")
            .iter()
            .any(|event| event.event_type == EventType::TaskCompleted)
    })
    .await;
    let completed = system
        .broker
        .queued_events("probe.autonomous")
        .into_iter()
        .find(|event| event.event_type == EventType::TaskCompleted)
        .expect("completion published");
    assert_eq!(completed.execution_id, Some(execution_id));
    assert_eq!(completed.payload_str("result"), Some("echo: summarize the quarter"));

    system.shutdown().await;
}

#[tokio::test]
async fn test_failing_task_is_recorded_failed_and_worker_is_released() {
    let failing = Arc::new(FailingCapability::default());
    let system = AgentSystem::start(
        vec![autonomous_worker("flaky")],
        StaticCapabilityFactory::new().with_default(failing.clone()),
    )
    .await;
    system.wait_for_status("flaky", WorkerStatus::Ready).await;

    let execution_id = system
        .orchestrator
        .invoke("flaky", json!({"prompt": "try"}))
        .await
        .expect("invocation routed");

    wait_until(|| {
        system
            .store
            .latest_execution(execution_id)
            .is_some_and(|record| record.status == "failed")
    })
    .await;
    system.wait_for_status("flaky", WorkerStatus::Ready).await;

    // one retry configured: two attempts in total
    assert_eq!(failing.call_count(), 2);

    system.shutdown().await;
}

#[tokio::test]
async fn test_event_driven_worker_is_invoked_by_matching_events() {
    let echo = Arc::new(EchoCapability::default());
    let system = AgentSystem::start(
        vec![event_driven_worker("watcher", ["alerts.#"])],
        StaticCapabilityFactory::new().with_default(echo.clone()),
    )
    .await;
    system.wait_for_status("watcher", WorkerStatus::Ready).await;

    let mut payload = Payload::new();
    payload.insert("prompt".to_string(), json!("disk almost full"));
    let alert = Event::system_event(EventType::SystemHealthCheck, "monitor", payload);
    assert!(system.bus.publish(&alert, Some("alerts.disk.full")).await);

    let unrelated = Event::system_event(EventType::SystemHealthCheck, "monitor", Payload::new());
    assert!(system.bus.publish(&unrelated, Some("metrics.cpu")).await);

    wait_until(|| {
        system
            .store
            .records_for_worker("watcher")
            .iter()
            .any(|record| record.status == "completed")
    })
    .await;
    system.wait_for_status("watcher", WorkerStatus::Ready).await;
    assert_eq!(echo.call_count(), 1);

    system.shutdown().await;
}
