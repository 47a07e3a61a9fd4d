//! # Capability Interface
//!
//! The language-model call is an external collaborator: every pool reaches
//! it only through [`Capability::execute`]. Instances are built per worker by
//! a [`CapabilityFactory`]; collaborative plans are broken into steps by a
//! [`Planner`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::events::Payload;
use crate::models::{PlanStep, WorkerConfig};

/// Capability error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Capability execution failed: {message}")]
    Execution { message: String },

    #[error("Missing API key {secret_key} for worker {worker_name}")]
    MissingApiKey {
        worker_name: String,
        secret_key: String,
    },

    #[error("Unsupported capability provider: {provider}")]
    UnsupportedProvider { provider: String },

    #[error("Planning failed: {message}")]
    Planning { message: String },
}

impl CapabilityError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub fn missing_api_key(worker_name: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self::MissingApiKey {
            worker_name: worker_name.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn unsupported_provider(provider: impl Into<String>) -> Self {
        Self::UnsupportedProvider {
            provider: provider.into(),
        }
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }
}

/// Output of one capability call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    pub response: String,
    /// Keys merged into a continuous worker's memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_updates: Option<Payload>,
}

impl CapabilityResponse {
    pub fn text(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            memory_updates: None,
        }
    }

    pub fn with_memory_updates(mut self, updates: Payload) -> Self {
        self.memory_updates = Some(updates);
        self
    }
}

/// Opaque executor behind a worker
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    async fn execute(
        &self,
        prompt: &str,
        context: &Payload,
    ) -> Result<CapabilityResponse, CapabilityError>;
}

/// Builds capability instances for a worker definition
pub trait CapabilityFactory: Send + Sync + 'static {
    fn create(
        &self,
        config: &WorkerConfig,
        api_key: Option<String>,
    ) -> Result<Arc<dyn Capability>, CapabilityError>;
}

/// Breaks a plan description into steps assigned to workers
#[async_trait]
pub trait Planner: Send + Sync + 'static {
    async fn plan(
        &self,
        description: &str,
        workers: &[String],
    ) -> Result<Vec<PlanStep>, CapabilityError>;
}

/// Fixed three-phase plan: analyze, process, summarize
///
/// The first worker gathers data and writes the final summary; the second
/// (or the first again when alone) does the processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialPlanner;

#[async_trait]
impl Planner for SequentialPlanner {
    async fn plan(
        &self,
        _description: &str,
        workers: &[String],
    ) -> Result<Vec<PlanStep>, CapabilityError> {
        let Some(first) = workers.first() else {
            return Err(CapabilityError::planning("no workers available for the plan"));
        };
        let second = workers.get(1).unwrap_or(first);

        Ok(vec![
            PlanStep::new(0, "Analyze task requirements and gather data", first)
                .with_success_criteria(["Data collected", "Requirements documented"]),
            PlanStep::new(1, "Process and analyze the gathered data", second)
                .with_success_criteria(["Analysis complete", "Insights generated"]),
            PlanStep::new(2, "Generate final recommendations and summary", first)
                .with_success_criteria(["Recommendations provided", "Summary complete"]),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_planner_alternates_workers() {
        let workers = vec!["researcher".to_string(), "analyst".to_string()];
        let steps = SequentialPlanner.plan("market report", &workers).await.unwrap();

        let assigned: Vec<&str> = steps.iter().map(|s| s.assigned_worker.as_str()).collect();
        assert_eq!(assigned, vec!["researcher", "analyst", "researcher"]);
        assert_eq!(steps[1].index, 1);
        assert_eq!(steps[2].success_criteria, vec!["Recommendations provided", "Summary complete"]);
    }

    #[tokio::test]
    async fn test_sequential_planner_single_worker_takes_every_step() {
        let steps = SequentialPlanner
            .plan("solo", &["only".to_string()])
            .await
            .unwrap();
        assert!(steps.iter().all(|s| s.assigned_worker == "only"));
    }

    #[tokio::test]
    async fn test_sequential_planner_requires_workers() {
        let result = SequentialPlanner.plan("nobody", &[]).await;
        assert!(matches!(result, Err(CapabilityError::Planning { .. })));
    }
}
