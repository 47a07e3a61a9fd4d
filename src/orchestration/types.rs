//! # Orchestrator Registry Types
//!
//! Registrations are owned by the orchestrator and mutated only through its
//! methods; everything handed out is a [`WorkerSnapshot`] copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::errors::{OrchestrationError, OrchestrationResult};
use crate::models::{ExecutionMode, WorkerConfig, WorkerType};
use crate::state_machine::WorkerStatus;

/// Runtime bookkeeping for one registered worker
#[derive(Debug, Clone)]
pub struct WorkerMetadata {
    pub status: WorkerStatus,
    pub capabilities: Vec<String>,
    pub subscriptions: Vec<String>,
    /// Monotonic time of the last heartbeat, used for health decisions
    pub last_heartbeat: Option<Instant>,
    /// Wall-clock time of the last heartbeat, for reporting
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub error: Option<String>,
    /// Set once the restart budget is spent; the worker stays FAILED
    pub restarts_exhausted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerMetadata {
    pub fn new(config: &WorkerConfig) -> Self {
        let now = Utc::now();
        Self {
            status: WorkerStatus::Initializing,
            capabilities: config.tags.clone(),
            subscriptions: config.event_subscriptions.clone(),
            last_heartbeat: None,
            last_heartbeat_at: None,
            restart_count: 0,
            error: None,
            restarts_exhausted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validated status change
    pub fn transition(&mut self, worker_name: &str, to: WorkerStatus) -> OrchestrationResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestrationError::invalid_transition(worker_name, self.status, to));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.last_heartbeat_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub config: WorkerConfig,
    pub metadata: WorkerMetadata,
}

impl WorkerRegistration {
    pub fn new(config: WorkerConfig) -> Self {
        let metadata = WorkerMetadata::new(&config);
        Self { config, metadata }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.config.name.clone(),
            worker_type: self.config.worker_type,
            execution_mode: self.config.execution_mode,
            status: self.metadata.status,
            capabilities: self.metadata.capabilities.clone(),
            event_subscriptions: self.metadata.subscriptions.clone(),
            last_heartbeat: self.metadata.last_heartbeat_at,
            restart_count: self.metadata.restart_count,
            error: self.metadata.error.clone(),
            created_at: self.metadata.created_at,
            updated_at: self.metadata.updated_at,
        }
    }
}

/// Read-only view of a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub worker_type: WorkerType,
    pub execution_mode: ExecutionMode,
    pub status: WorkerStatus,
    pub capabilities: Vec<String>,
    pub event_subscriptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional filters for `registry_snapshot`; unset fields match everything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryFilter {
    pub status: Option<WorkerStatus>,
    pub worker_type: Option<WorkerType>,
    pub execution_mode: Option<ExecutionMode>,
}

impl RegistryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = Some(worker_type);
        self
    }

    pub fn with_execution_mode(mut self, execution_mode: ExecutionMode) -> Self {
        self.execution_mode = Some(execution_mode);
        self
    }

    pub fn matches(&self, registration: &WorkerRegistration) -> bool {
        self.status.map_or(true, |s| registration.metadata.status == s)
            && self
                .worker_type
                .map_or(true, |t| registration.config.worker_type == t)
            && self
                .execution_mode
                .map_or(true, |m| registration.config.execution_mode == m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CapabilitySpec;

    fn registration() -> WorkerRegistration {
        WorkerRegistration::new(
            WorkerConfig::new(
                "watcher",
                WorkerType::Autonomous,
                ExecutionMode::EventDriven,
                CapabilitySpec::new("anthropic", "claude"),
            )
            .with_tags(["search"])
            .with_subscriptions(["task.#"]),
        )
    }

    #[test]
    fn test_metadata_starts_initializing() {
        let registration = registration();
        assert_eq!(registration.metadata.status, WorkerStatus::Initializing);
        assert_eq!(registration.metadata.capabilities, vec!["search"]);
        assert_eq!(registration.metadata.subscriptions, vec!["task.#"]);
        assert!(registration.metadata.last_heartbeat.is_none());
    }

    #[test]
    fn test_transition_is_validated() {
        let mut registration = registration();
        registration.metadata.transition("watcher", WorkerStatus::Ready).unwrap();
        registration.metadata.transition("watcher", WorkerStatus::Shutdown).unwrap();

        let result = registration.metadata.transition("watcher", WorkerStatus::Ready);
        assert!(matches!(
            result,
            Err(OrchestrationError::InvalidStatusTransition { from: WorkerStatus::Shutdown, .. })
        ));
    }

    #[test]
    fn test_filter_matching() {
        let registration = registration();
        assert!(RegistryFilter::all().matches(&registration));
        assert!(RegistryFilter::all()
            .with_worker_type(WorkerType::Autonomous)
            .with_execution_mode(ExecutionMode::EventDriven)
            .matches(&registration));
        assert!(!RegistryFilter::all().with_status(WorkerStatus::Ready).matches(&registration));
    }
}
