//! # Execution Pools
//!
//! The three places a worker's task can run, chosen by
//! [`PoolRoute`](crate::orchestration::PoolRoute):
//!
//! - **IsolatedPool**: stateless autonomous tasks with round-robin instances
//!   and fixed-delay retries
//! - **PlanningPool**: collaborative multi-step plans with clarification pauses
//! - **PersistentRunner**: long-lived continuous workers with checkpointed
//!   conversation state
//!
//! Every pool takes its work from the bus and reports back on it; none of
//! them touches the orchestrator's registry.

pub mod balancer;
pub mod errors;
pub mod isolated;
pub mod persistent;
pub mod planning;

pub use balancer::{RoundRobinBalancer, WorkerInstance};
pub use errors::{PoolError, PoolResult};
pub use isolated::IsolatedPool;
pub use persistent::{MaintenanceReport, PersistentRunner};
pub use planning::PlanningPool;
