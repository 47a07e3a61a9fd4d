//! # Pool Routing
//!
//! Maps a worker definition onto the execution pool that runs it. The match
//! is total over [`WorkerType`] and [`ExecutionMode`], so there is no
//! fallback route.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::routing;
use crate::models::{WorkerConfig, WorkerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRoute {
    /// Long-lived stateful runner
    Persistent,
    /// Multi-step collaborative planning
    Planning,
    /// Stateless round-robin execution
    Isolated,
}

impl PoolRoute {
    /// Continuous execution wins over the declared worker type
    pub fn for_worker(config: &WorkerConfig) -> Self {
        if config.is_continuous() {
            return Self::Persistent;
        }
        match config.worker_type {
            WorkerType::Collaborative => Self::Planning,
            WorkerType::Autonomous => Self::Isolated,
            WorkerType::Continuous => Self::Persistent,
        }
    }

    /// Routing key a `task.submitted` event for this worker is published on
    pub fn routing_key(&self, worker_name: &str) -> String {
        match self {
            Self::Persistent => routing::continuous_task(worker_name),
            Self::Planning => routing::COLLABORATIVE_TASK_SUBMITTED.to_string(),
            Self::Isolated => routing::AUTONOMOUS_TASK_SUBMITTED.to_string(),
        }
    }
}

impl fmt::Display for PoolRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::Planning => write!(f, "planning"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}
