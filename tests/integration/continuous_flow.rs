use std::sync::Arc;

use agentrunner_core::constants::routing;
use agentrunner_core::events::{Event, EventType, Payload};
use agentrunner_core::state_machine::WorkerStatus;
use agentrunner_core::test_utils::{
    continuous_worker, probe_queue, wait_until, ScriptedCapability, StaticCapabilityFactory,
};
use serde_json::json;

use crate::common::AgentSystem;

#[tokio::test]
async fn test_continuous_worker_keeps_conversation_across_invocations() {
    let assistant = Arc::new(ScriptedCapability::default().with_fallback("noted"));
    let system = AgentSystem::start(
        vec![continuous_worker("assistant")],
        StaticCapabilityFactory::new().with_worker("assistant", assistant.clone()),
    )
    .await;
    probe_queue(&system.bus, "probe.output", ["agent.output.#"]).await;
    system.wait_for_status("assistant", WorkerStatus::Ready).await;
    assert!(system.runner.is_running("assistant").await);

    for (turn, prompt) in ["remember the code word is heron", "what is the code word?"]
        .into_iter()
        .enumerate()
    {
        system
            .orchestrator
            .invoke("assistant", json!({"prompt": prompt}))
            .await
            .expect("invocation routed");
        wait_until(|| system.broker.queued_events("probe.output").len() == turn + 1).await;
        system.wait_for_status("assistant", WorkerStatus::Ready).await;
    }

    let calls = assistant.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].prompt, "what is the code word?");
    let history = calls[1].context["conversation_history"]
        .as_array()
        .expect("history passed as context");
    assert_eq!(history.len(), 3);
    assert_eq!(history[0]["content"], "remember the code word is heron");
    assert_eq!(history[1]["content"], "noted");

    let outputs = system.broker.queued_events("probe.output");
    assert!(outputs.iter().all(|event| event.event_type == EventType::TaskCompleted));
    assert_eq!(outputs[1].payload["event_count"], 2);
    assert_eq!(outputs[1].payload["result"], "noted");

    let state = system.runner.worker_state("assistant").await.expect("worker running");
    assert_eq!(state.event_count, 2);
    assert_eq!(state.conversation_history.len(), 4);

    system.shutdown().await;
}

#[tokio::test]
async fn test_input_published_directly_reaches_running_worker() {
    let assistant = Arc::new(ScriptedCapability::default().with_fallback("on it"));
    let system = AgentSystem::start(
        vec![continuous_worker("assistant")],
        StaticCapabilityFactory::new().with_worker("assistant", assistant.clone()),
    )
    .await;
    probe_queue(&system.bus, "probe.output", ["agent.output.#"]).await;

    let mut payload = Payload::new();
    payload.insert("prompt".to_string(), json!("new ticket arrived"));
    let event = Event::worker_event(EventType::TaskSubmitted, "assistant", payload);
    assert!(
        system
            .bus
            .publish(&event, Some(&routing::worker_input("assistant")))
            .await
    );

    wait_until(|| system.broker.queued_events("probe.output").len() == 1).await;
    assert_eq!(assistant.calls()[0].prompt, "new ticket arrived");

    system.shutdown().await;
}
