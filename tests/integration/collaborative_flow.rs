use std::sync::Arc;

use agentrunner_core::capability::CapabilityError;
use agentrunner_core::constants::services;
use agentrunner_core::events::EventType;
use agentrunner_core::state_machine::WorkerStatus;
use agentrunner_core::test_utils::{
    collaborative_worker, probe_queue, wait_until, EchoCapability, ScriptedCapability,
    StaticCapabilityFactory,
};
use serde_json::json;

use crate::common::AgentSystem;

#[tokio::test]
async fn test_invoked_collaborative_worker_runs_a_full_plan() {
    let echo = Arc::new(EchoCapability::default());
    let system = AgentSystem::start(
        vec![collaborative_worker("analyst"), collaborative_worker("writer")],
        StaticCapabilityFactory::new().with_default(echo.clone()),
    )
    .await;
    probe_queue(&system.bus, "probe.collaboration", ["collaboration.#"]).await;
    probe_queue(&system.bus, "probe.reports", ["collaborative.task.#"]).await;
    system.wait_for_status("analyst", WorkerStatus::Ready).await;

    let execution_id = system
        .orchestrator
        .invoke("analyst", json!({"description": "market entry report"}))
        .await
        .expect("invocation routed");

    wait_until(|| !system.store.records_for_worker(services::PLANNING_POOL).is_empty()).await;
    system.wait_for_status("analyst", WorkerStatus::Ready).await;

    let records = system.store.records_for_worker(services::PLANNING_POOL);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "completed");
    assert_eq!(records[0].result["completed_steps"], 3);
    assert_eq!(records[0].result["participating_workers"], json!(["analyst", "writer"]));
    assert_eq!(system.planning.active_plan_count(), 0);
    assert_eq!(echo.call_count(), 3);

    let plan_events: Vec<EventType> = system
        .broker
        .queued_events("probe.collaboration")
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        plan_events,
        vec![
            EventType::PlanStepCompleted,
            EventType::PlanStepCompleted,
            EventType::PlanStepCompleted,
            EventType::PlanCompleted,
        ]
    );

    let reports = system.broker.queued_events("probe.reports");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].event_type, EventType::TaskCompleted);
    assert_eq!(reports[0].payload_str("worker_name"), Some("analyst"));
    assert_eq!(
        reports[0].payload_str("execution_id"),
        Some(execution_id.to_string().as_str())
    );

    system.shutdown().await;
}

#[tokio::test]
async fn test_failed_step_closes_plan_as_partial_and_releases_worker() {
    let writer = Arc::new(ScriptedCapability::new([Err(CapabilityError::execution(
        "model overloaded",
    ))]));
    let factory = StaticCapabilityFactory::new()
        .with_default(Arc::new(EchoCapability::default()))
        .with_worker("writer", writer.clone());
    let system = AgentSystem::start(
        vec![collaborative_worker("analyst"), collaborative_worker("writer")],
        factory,
    )
    .await;
    probe_queue(&system.bus, "probe.collaboration", ["collaboration.#"]).await;
    system.wait_for_status("analyst", WorkerStatus::Ready).await;

    system
        .orchestrator
        .invoke("analyst", json!({"description": "risky report"}))
        .await
        .expect("invocation routed");

    wait_until(|| !system.store.records_for_worker(services::PLANNING_POOL).is_empty()).await;
    system.wait_for_status("analyst", WorkerStatus::Ready).await;

    let record = system
        .store
        .records_for_worker(services::PLANNING_POOL)
        .remove(0);
    assert_eq!(record.status, "partial");
    assert_eq!(record.result["completed_steps"], 1);
    assert_eq!(writer.call_count(), 1);

    let plan_events: Vec<EventType> = system
        .broker
        .queued_events("probe.collaboration")
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(
        plan_events,
        vec![
            EventType::PlanStepCompleted,
            EventType::PlanFailed,
            EventType::PlanCompleted,
        ]
    );

    system.shutdown().await;
}
