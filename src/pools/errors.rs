//! # Pool Error Types

use thiserror::Error;
use uuid::Uuid;

use crate::capability::CapabilityError;
use crate::messaging::MessagingError;
use crate::state_machine::PlanStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("No instances available for worker: {worker_name}")]
    NoInstances { worker_name: String },

    #[error("Plan not found: {plan_id}")]
    PlanNotFound { plan_id: Uuid },

    #[error("Invalid step index for plan {plan_id}: expected {expected}, got {actual}")]
    InvalidStepIndex {
        plan_id: Uuid,
        expected: usize,
        actual: usize,
    },

    #[error("Plan {plan_id} cannot execute steps in status {status}")]
    InvalidPlanState { plan_id: Uuid, status: PlanStatus },

    #[error("Plan {plan_id} cannot move from {from} to {to}")]
    InvalidPlanTransition {
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
    },

    #[error("Step {index} of plan {plan_id} is already running")]
    StepInProgress { plan_id: Uuid, index: usize },

    #[error("Plan {plan_id} is not waiting for clarification {clarification_id}")]
    UnexpectedClarification { plan_id: Uuid, clarification_id: String },

    #[error("Worker is not running: {worker_name}")]
    WorkerNotRunning { worker_name: String },

    #[error("Invalid task payload: {message}")]
    InvalidPayload { message: String },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl PoolError {
    pub fn no_instances(worker_name: impl Into<String>) -> Self {
        Self::NoInstances {
            worker_name: worker_name.into(),
        }
    }

    pub fn plan_not_found(plan_id: Uuid) -> Self {
        Self::PlanNotFound { plan_id }
    }

    pub fn invalid_step_index(plan_id: Uuid, expected: usize, actual: usize) -> Self {
        Self::InvalidStepIndex {
            plan_id,
            expected,
            actual,
        }
    }

    pub fn invalid_plan_state(plan_id: Uuid, status: PlanStatus) -> Self {
        Self::InvalidPlanState { plan_id, status }
    }

    pub fn invalid_plan_transition(plan_id: Uuid, from: PlanStatus, to: PlanStatus) -> Self {
        Self::InvalidPlanTransition { plan_id, from, to }
    }

    pub fn step_in_progress(plan_id: Uuid, index: usize) -> Self {
        Self::StepInProgress { plan_id, index }
    }

    pub fn unexpected_clarification(plan_id: Uuid, clarification_id: impl Into<String>) -> Self {
        Self::UnexpectedClarification {
            plan_id,
            clarification_id: clarification_id.into(),
        }
    }

    pub fn worker_not_running(worker_name: impl Into<String>) -> Self {
        Self::WorkerNotRunning {
            worker_name: worker_name.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
