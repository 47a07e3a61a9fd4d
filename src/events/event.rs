//! # Event Envelope
//!
//! The immutable message envelope carried by the bus. Everything that crosses
//! a pool boundary travels inside an [`Event`] payload.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::constants::defaults::EVENT_MAX_RETRIES;

/// Opaque key/value payload carried by events
pub type Payload = Map<String, Value>;

/// Event types understood by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Worker lifecycle
    #[serde(rename = "agent.started")]
    WorkerStarted,
    #[serde(rename = "agent.stopped")]
    WorkerStopped,
    #[serde(rename = "agent.error")]
    WorkerError,
    #[serde(rename = "agent.heartbeat")]
    WorkerHeartbeat,

    // Task lifecycle
    #[serde(rename = "task.submitted")]
    TaskSubmitted,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.timeout")]
    TaskTimeout,
    #[serde(rename = "task.cancelled")]
    TaskCancelled,

    // State management
    #[serde(rename = "state.saved")]
    StateSaved,
    #[serde(rename = "state.loaded")]
    StateLoaded,
    #[serde(rename = "state.recovered")]
    StateRecovered,

    // Plans
    #[serde(rename = "plan.created")]
    PlanCreated,
    #[serde(rename = "plan.started")]
    PlanStarted,
    #[serde(rename = "plan.step.completed")]
    PlanStepCompleted,
    #[serde(rename = "plan.step.failed")]
    PlanStepFailed,
    #[serde(rename = "plan.completed")]
    PlanCompleted,
    #[serde(rename = "plan.failed")]
    PlanFailed,
    #[serde(rename = "plan.clarification.requested")]
    PlanClarificationRequested,
    #[serde(rename = "plan.clarification.received")]
    PlanClarificationReceived,

    // System
    #[serde(rename = "system.shutdown")]
    SystemShutdown,
    #[serde(rename = "system.health.check")]
    SystemHealthCheck,
}

impl EventType {
    /// Wire name of the event type (dot-delimited)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerStarted => "agent.started",
            Self::WorkerStopped => "agent.stopped",
            Self::WorkerError => "agent.error",
            Self::WorkerHeartbeat => "agent.heartbeat",
            Self::TaskSubmitted => "task.submitted",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskTimeout => "task.timeout",
            Self::TaskCancelled => "task.cancelled",
            Self::StateSaved => "state.saved",
            Self::StateLoaded => "state.loaded",
            Self::StateRecovered => "state.recovered",
            Self::PlanCreated => "plan.created",
            Self::PlanStarted => "plan.started",
            Self::PlanStepCompleted => "plan.step.completed",
            Self::PlanStepFailed => "plan.step.failed",
            Self::PlanCompleted => "plan.completed",
            Self::PlanFailed => "plan.failed",
            Self::PlanClarificationRequested => "plan.clarification.requested",
            Self::PlanClarificationReceived => "plan.clarification.received",
            Self::SystemShutdown => "system.shutdown",
            Self::SystemHealthCheck => "system.health.check",
        }
    }

    /// All event types, in declaration order
    pub const ALL: [EventType; 23] = [
        Self::WorkerStarted,
        Self::WorkerStopped,
        Self::WorkerError,
        Self::WorkerHeartbeat,
        Self::TaskSubmitted,
        Self::TaskStarted,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskTimeout,
        Self::TaskCancelled,
        Self::StateSaved,
        Self::StateLoaded,
        Self::StateRecovered,
        Self::PlanCreated,
        Self::PlanStarted,
        Self::PlanStepCompleted,
        Self::PlanStepFailed,
        Self::PlanCompleted,
        Self::PlanFailed,
        Self::PlanClarificationRequested,
        Self::PlanClarificationReceived,
        Self::SystemShutdown,
        Self::SystemHealthCheck,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| format!("Invalid event type: {s}"))
    }
}

/// Delivery priority, encoded into the default routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for EventPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid event priority: {s}")),
        }
    }
}

/// Message envelope published on the bus
///
/// Events are built with the constructor helpers and `with_*` builders, then
/// handed to the bus by reference; nothing mutates an event after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: EventPriority,
    /// Time to live in seconds, measured from `timestamp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    EVENT_MAX_RETRIES
}

impl Event {
    /// Create an event of the given type with an empty payload
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            source_worker: None,
            source_service: None,
            trace_id: None,
            execution_id: None,
            parent_id: None,
            payload: Payload::new(),
            priority: EventPriority::Normal,
            ttl: None,
            retry_count: 0,
            max_retries: EVENT_MAX_RETRIES,
        }
    }

    /// Worker-originated event (lifecycle, heartbeat, output)
    pub fn worker_event(event_type: EventType, worker_name: &str, payload: Payload) -> Self {
        Self::new(event_type)
            .with_source_worker(worker_name)
            .with_payload(payload)
    }

    /// Task event; `task_id` is merged into the task data
    pub fn task_event(
        event_type: EventType,
        worker_name: &str,
        task_id: &str,
        task_data: Payload,
    ) -> Self {
        let mut payload = Payload::new();
        payload.insert("task_id".to_string(), Value::String(task_id.to_string()));
        payload.extend(task_data);
        Self::worker_event(event_type, worker_name, payload)
    }

    /// State persistence event for a worker
    pub fn state_event(event_type: EventType, worker_name: &str, state_info: Payload) -> Self {
        Self::worker_event(event_type, worker_name, state_info)
    }

    /// Plan event; `plan_id` is merged into the plan data
    pub fn plan_event(event_type: EventType, plan_id: Uuid, plan_data: Payload) -> Self {
        let mut payload = Payload::new();
        payload.insert("plan_id".to_string(), Value::String(plan_id.to_string()));
        payload.extend(plan_data);
        Self::new(event_type)
            .with_source_service(crate::constants::services::PLANNING_POOL)
            .with_payload(payload)
    }

    /// System-level event emitted by a named service
    pub fn system_event(event_type: EventType, service_name: &str, data: Payload) -> Self {
        Self::new(event_type)
            .with_source_service(service_name)
            .with_payload(data)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_source_worker(mut self, worker_name: impl Into<String>) -> Self {
        self.source_worker = Some(worker_name.into());
        self
    }

    pub fn with_source_service(mut self, service_name: impl Into<String>) -> Self {
        self.source_service = Some(service_name.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<Uuid>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Mark this event as caused by `parent`, inheriting its trace id
    pub fn with_parent(mut self, parent: &Event) -> Self {
        self.parent_id = Some(parent.id);
        if self.trace_id.is_none() {
            self.trace_id = parent.trace_id;
        }
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl = Some(ttl_seconds);
        self
    }

    /// Default routing key: `{type}.{priority}`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.event_type, self.priority)
    }

    /// Whether the event's ttl has elapsed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let ttl = ChronoDuration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX));
                now.signed_duration_since(self.timestamp) > ttl
            }
            None => false,
        }
    }

    /// String value from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
