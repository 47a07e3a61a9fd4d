//! # State Store
//!
//! Durable storage is an external collaborator. Pools persist execution
//! results, plan progress and continuous-worker checkpoints through the
//! [`StateStore`] trait; callers log failures and carry on.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::events::Payload;

pub use in_memory::InMemoryStateStore;

/// State store error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateStoreError {
    #[error("State store unavailable: {message}")]
    Unavailable { message: String },

    #[error("State serialization failed: {message}")]
    Serialization { message: String },

    #[error("State store operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl StateStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StateStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// One persisted execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub worker_name: String,
    pub execution_id: Uuid,
    pub status: String,
    pub result: Value,
    pub duration_seconds: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence boundary shared by the orchestrator and the pools
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Checkpoint a continuous worker's state
    async fn save_state(&self, worker_name: &str, state: Payload) -> StateStoreResult<()>;

    /// Most recent checkpoint for a worker, if any
    async fn load_latest_state(&self, worker_name: &str) -> StateStoreResult<Option<Payload>>;

    async fn save_execution_result(
        &self,
        worker_name: &str,
        execution_id: Uuid,
        status: &str,
        result: Value,
        duration_seconds: f64,
    ) -> StateStoreResult<()>;

    async fn update_plan_state(&self, plan_id: Uuid, state: Payload) -> StateStoreResult<()>;
}
