//! # Orchestration Error Types
//!
//! Failures surfaced by the worker orchestrator. Lifecycle problems at
//! runtime are mostly logged and reflected in worker status; these errors are
//! returned where a caller asked for something that cannot happen.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::state_machine::WorkerStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("Worker not found: {worker_name}")]
    WorkerNotFound { worker_name: String },

    #[error("Worker already registered: {worker_name}")]
    DuplicateWorker { worker_name: String },

    #[error("Worker is disabled: {worker_name}")]
    WorkerDisabled { worker_name: String },

    #[error("Invalid configuration for worker {worker_name}: {reason}")]
    InvalidConfig { worker_name: String, reason: String },

    #[error("Invalid status transition for worker {worker_name}: {from} -> {to}")]
    InvalidStatusTransition {
        worker_name: String,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    #[error("Worker {worker_name} is not ready (status: {status})")]
    NotReady {
        worker_name: String,
        status: WorkerStatus,
    },

    #[error("Routing failed for worker {worker_name} via {routing_key}: {message}")]
    RoutingFailed {
        worker_name: String,
        routing_key: String,
        message: String,
    },

    #[error("Worker directory error: {0}")]
    Directory(#[from] ConfigurationError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl OrchestrationError {
    pub fn worker_not_found(worker_name: impl Into<String>) -> Self {
        Self::WorkerNotFound {
            worker_name: worker_name.into(),
        }
    }

    pub fn duplicate_worker(worker_name: impl Into<String>) -> Self {
        Self::DuplicateWorker {
            worker_name: worker_name.into(),
        }
    }

    pub fn worker_disabled(worker_name: impl Into<String>) -> Self {
        Self::WorkerDisabled {
            worker_name: worker_name.into(),
        }
    }

    pub fn invalid_config(worker_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            worker_name: worker_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_transition(
        worker_name: impl Into<String>,
        from: WorkerStatus,
        to: WorkerStatus,
    ) -> Self {
        Self::InvalidStatusTransition {
            worker_name: worker_name.into(),
            from,
            to,
        }
    }

    pub fn not_ready(worker_name: impl Into<String>, status: WorkerStatus) -> Self {
        Self::NotReady {
            worker_name: worker_name.into(),
            status,
        }
    }

    pub fn routing_failed(
        worker_name: impl Into<String>,
        routing_key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::RoutingFailed {
            worker_name: worker_name.into(),
            routing_key: routing_key.into(),
            message: message.to_string(),
        }
    }
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
