//! # Worker Orchestration
//!
//! The orchestrator owns every worker registration and drives it through the
//! [`WorkerStatus`](crate::state_machine::WorkerStatus) lifecycle.
//!
//! ## Core Components
//!
//! - **WorkerOrchestrator**: registration, start, invocation and shutdown
//! - **PoolRoute**: the single mapping from worker definition to execution pool
//! - **Health loop**: periodic reconciliation, heartbeat checks and bounded restarts
//! - **Lifecycle listener**: heartbeats and task completions from the bus
//!
//! Workers never touch the registry directly; pools report back through bus
//! events that the lifecycle listener consumes.

pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod router;
pub mod types;

pub use errors::{OrchestrationError, OrchestrationResult};
pub use health::HealthReport;
pub use orchestrator::WorkerOrchestrator;
pub use router::PoolRoute;
pub use types::{RegistryFilter, WorkerMetadata, WorkerRegistration, WorkerSnapshot};
