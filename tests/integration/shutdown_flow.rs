use std::sync::Arc;
use std::time::Duration;

use agentrunner_core::config::PersistentRunnerConfig;
use agentrunner_core::orchestration::RegistryFilter;
use agentrunner_core::pools::PersistentRunner;
use agentrunner_core::state_machine::WorkerStatus;
use agentrunner_core::test_utils::{
    autonomous_worker, continuous_worker, probe_queue, wait_until, EchoCapability,
    StaticCapabilityFactory,
};
use serde_json::json;

use crate::common::AgentSystem;

#[tokio::test]
async fn test_shutdown_persists_continuous_state_for_the_next_run() {
    let factory = StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default()));
    let system = AgentSystem::start(
        vec![continuous_worker("assistant"), autonomous_worker("summarizer")],
        factory,
    )
    .await;
    probe_queue(&system.bus, "probe.output", ["agent.output.#"]).await;
    system.wait_for_status("assistant", WorkerStatus::Ready).await;

    system
        .orchestrator
        .invoke("assistant", json!({"prompt": "keep this"}))
        .await
        .expect("invocation routed");
    wait_until(|| system.broker.queued_events("probe.output").len() == 1).await;
    assert!(system.store.latest_state("assistant").is_none());

    system.orchestrator.shutdown(Some(Duration::from_secs(2))).await;

    // The stop announcement reaches the runner through its control queue
    wait_until(|| system.store.latest_state("assistant").is_some()).await;
    let saved = system.store.latest_state("assistant").expect("state saved");
    assert_eq!(saved["event_count"], 1);

    let snapshots = system.orchestrator.registry_snapshot(RegistryFilter::default()).await;
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots.iter().all(|s| s.status == WorkerStatus::Shutdown));
    assert!(system.orchestrator.invoke("summarizer", json!({})).await.is_none());

    system.runner.stop().await;
    assert!(system.runner.running_workers().await.is_empty());

    let restarted = Arc::new(PersistentRunner::new(
        PersistentRunnerConfig::default(),
        Arc::clone(&system.bus),
        system.directory.clone(),
        system.store.clone(),
        Arc::new(StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default()))),
    ));
    restarted
        .start_worker(continuous_worker("assistant"))
        .await
        .expect("worker restarts");
    let state = restarted.worker_state("assistant").await.expect("worker running");
    assert_eq!(state.event_count, 1);
    assert_eq!(state.conversation_history.len(), 2);

    restarted.stop().await;
    system.bus.close().await.expect("bus closes");
}
