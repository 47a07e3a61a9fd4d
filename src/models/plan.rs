//! # Collaborative Plan Model
//!
//! Multi-step plans executed by the planning pool. Step outcomes and human
//! clarifications accumulate in `results`, keyed `step_{index}` and
//! `clarification_{id}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use crate::events::Payload;
use crate::state_machine::{PlanStatus, StepStatus};

/// One unit of work in a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub description: String,
    pub assigned_worker: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
}

impl PlanStep {
    pub fn new(
        index: usize,
        description: impl Into<String>,
        assigned_worker: impl Into<String>,
    ) -> Self {
        Self {
            index,
            description: description.into(),
            assigned_worker: assigned_worker.into(),
            success_criteria: Vec::new(),
        }
    }

    pub fn with_success_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

/// Recorded result of executing a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub worker: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
}

impl StepOutcome {
    pub fn completed(step: &PlanStep, result: String) -> Self {
        Self {
            worker: step.assigned_worker.clone(),
            description: step.description.clone(),
            result: Some(result),
            error: None,
            status: StepStatus::Completed,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(step: &PlanStep, error: String) -> Self {
        Self {
            worker: step.assigned_worker.clone(),
            description: step.description.clone(),
            result: None,
            error: Some(error),
            status: StepStatus::Failed,
            timestamp: Utc::now(),
        }
    }
}

/// A plan and its accumulated results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativePlan {
    pub id: Uuid,
    pub description: String,
    pub participating_workers: Vec<String>,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub current_step_index: usize,
    pub results: Payload,
    /// Clarification the plan is suspended on
    #[serde(default)]
    pub pending_clarification: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollaborativePlan {
    pub fn new(
        description: impl Into<String>,
        participating_workers: Vec<String>,
        steps: Vec<PlanStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            participating_workers,
            steps,
            status: PlanStatus::Pending,
            current_step_index: 0,
            results: Payload::new(),
            pending_clarification: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Every step has run
    pub fn all_steps_done(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    pub fn step_key(index: usize) -> String {
        format!("step_{index}")
    }

    pub fn clarification_key(clarification_id: &str) -> String {
        format!("clarification_{clarification_id}")
    }

    /// Record a step outcome under `step_{index}`
    pub fn record_step(&mut self, index: usize, outcome: &StepOutcome) {
        self.results.insert(
            Self::step_key(index),
            serde_json::to_value(outcome).unwrap_or(Value::Null),
        );
        self.touch();
    }

    /// Change status if the plan state machine allows it
    ///
    /// Returns the rejected target on failure and leaves the plan untouched.
    pub fn transition(&mut self, to: PlanStatus) -> Result<(), PlanStatus> {
        if !self.status.can_transition_to(to) {
            return Err(to);
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// State persisted through `StateStore::update_plan_state`
    pub fn state_snapshot(&self) -> Payload {
        let mut state = Payload::new();
        state.insert("plan_id".to_string(), json!(self.id.to_string()));
        state.insert("description".to_string(), json!(self.description));
        state.insert("status".to_string(), json!(self.status));
        state.insert("current_step".to_string(), json!(self.current_step_index));
        if let Some(clarification_id) = &self.pending_clarification {
            state.insert("pending_clarification".to_string(), json!(clarification_id));
        }
        state.insert("total_steps".to_string(), json!(self.total_steps()));
        state.insert("participating_workers".to_string(), json!(self.participating_workers));
        state.insert("results".to_string(), Value::Object(self.results.clone()));
        state
    }
}

/// Whether every step ran before aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanCompletion {
    Completed,
    Partial,
}

impl fmt::Display for PlanCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

/// Aggregated view returned when a plan is closed out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: Uuid,
    pub description: String,
    pub status: PlanCompletion,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub participating_workers: Vec<String>,
    pub results: Payload,
}

/// A worker's part in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Assigned the first step
    Initiator,
    /// Assigned the last step
    Finalizer,
    /// Assigned some other step
    Processor,
    /// Participating without an assigned step
    Observer,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Finalizer => write!(f, "finalizer"),
            Self::Processor => write!(f, "processor"),
            Self::Observer => write!(f, "observer"),
        }
    }
}
