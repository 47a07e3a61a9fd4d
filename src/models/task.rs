//! # Autonomous Task Model
//!
//! A single isolated-pool execution. Tasks live only in the pool's active-task
//! table while running; the durable record is the execution result written
//! through the [`StateStore`](crate::state::StateStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state_machine::TaskStatus;

/// One isolated execution, including its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousTask {
    pub id: Uuid,
    pub worker_name: String,
    pub execution_id: Uuid,
    pub input: Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AutonomousTask {
    pub fn new(
        worker_name: impl Into<String>,
        execution_id: Uuid,
        input: Value,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_name: worker_name.into(),
            execution_id,
            input,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Another attempt is allowed after the current failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Total attempts so far, including the one in progress
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn mark_completed(&mut self, result: String) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock time from start to completion (or now)
    pub fn duration_seconds(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1_000.0
    }
}

/// Result handed back to the caller of `IsolatedPool::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub worker_name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_seconds: f64,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

impl From<&AutonomousTask> for TaskOutcome {
    fn from(task: &AutonomousTask) -> Self {
        Self {
            task_id: task.id,
            execution_id: task.execution_id,
            worker_name: task.worker_name.clone(),
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            attempts: task.attempts(),
            duration_seconds: task.duration_seconds(),
        }
    }
}
