use agentrunner_core::events::{Event, EventPriority, EventType, Payload};
use proptest::prelude::*;
use proptest::strategy::Just;
use serde_json::json;

/// One routing-key segment: never empty, never a wildcard
pub fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,11}"
}

/// Dot-delimited routing key of one to six segments
pub fn routing_key_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(segment_strategy(), 1..=6).prop_map(|segments| segments.join("."))
}

/// Routing key split into `(segments, index)` with a valid index into it
pub fn key_with_index_strategy() -> impl Strategy<Value = (Vec<String>, usize)> {
    prop::collection::vec(segment_strategy(), 1..=6)
        .prop_flat_map(|segments| {
            let len = segments.len();
            (Just(segments), 0..len)
        })
}

pub fn event_type_strategy() -> impl Strategy<Value = EventType> {
    prop_oneof![
        Just(EventType::WorkerStarted),
        Just(EventType::WorkerStopped),
        Just(EventType::WorkerHeartbeat),
        Just(EventType::TaskSubmitted),
        Just(EventType::TaskCompleted),
        Just(EventType::TaskFailed),
        Just(EventType::StateSaved),
        Just(EventType::PlanStepCompleted),
        Just(EventType::PlanCompleted),
        Just(EventType::PlanClarificationRequested),
        Just(EventType::SystemShutdown),
    ]
}

pub fn priority_strategy() -> impl Strategy<Value = EventPriority> {
    prop_oneof![
        Just(EventPriority::Low),
        Just(EventPriority::Normal),
        Just(EventPriority::High),
        Just(EventPriority::Critical),
    ]
}

/// Payloads limited to values JSON represents exactly
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(
        "[a-z_]{1,12}",
        prop_oneof![
            any::<i64>().prop_map(|n| json!(n)),
            any::<bool>().prop_map(|b| json!(b)),
            "[a-zA-Z0-9 .,!?]{0,40}".prop_map(|s| json!(s)),
            Just(json!(null)),
            Just(json!({"nested": {"data": [1, 2, 3]}})),
        ],
        0..6,
    )
    .prop_map(|entries| entries.into_iter().collect())
}

/// Events with every optional envelope field exercised
pub fn event_strategy() -> impl Strategy<Value = Event> {
    (
        event_type_strategy(),
        prop::option::of(segment_strategy()),
        prop::option::of(segment_strategy()),
        payload_strategy(),
        priority_strategy(),
        prop::option::of(1u64..86_400),
        0u32..5,
    )
        .prop_map(
            |(event_type, worker, service, payload, priority, ttl, retry_count)| {
                let mut event = Event::new(event_type)
                    .with_payload(payload)
                    .with_priority(priority);
                if let Some(worker) = worker {
                    event = event.with_source_worker(worker);
                }
                if let Some(service) = service {
                    event = event.with_source_service(service);
                }
                if let Some(ttl) = ttl {
                    event = event.with_ttl(ttl);
                }
                event.retry_count = retry_count;
                event
            },
        )
}
