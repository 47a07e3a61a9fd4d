pub mod continuous_state;
pub mod plan;
pub mod task;
pub mod worker_config;

// Re-export core models for easy access
pub use continuous_state::{ContinuousState, HistoryEntry, HistoryRole};
pub use plan::{CollaborativePlan, PlanCompletion, PlanStep, PlanSummary, StepOutcome, WorkerRole};
pub use task::{AutonomousTask, TaskOutcome};
pub use worker_config::{CapabilitySpec, ExecutionMode, WorkerConfig, WorkerType};
