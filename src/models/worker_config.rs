//! # Worker Configuration Model
//!
//! Read-only worker definitions supplied by the
//! [`WorkerDirectory`](crate::registry::WorkerDirectory). The orchestrator and
//! the pools never mutate a `WorkerConfig`; they clone what they need.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigurationError;
use crate::events::validate_pattern;

/// Which pool family a worker belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Multi-step planning with other workers
    Collaborative,
    /// Stateless single-shot tasks
    Autonomous,
    /// Long-lived conversational state
    Continuous,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collaborative => write!(f, "collaborative"),
            Self::Autonomous => write!(f, "autonomous"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

impl std::str::FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collaborative" => Ok(Self::Collaborative),
            "autonomous" => Ok(Self::Autonomous),
            "continuous" => Ok(Self::Continuous),
            _ => Err(format!("Invalid worker type: {s}")),
        }
    }
}

/// How a worker is triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    OnDemand,
    Scheduled,
    Continuous,
    EventDriven,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnDemand => write!(f, "on_demand"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Continuous => write!(f, "continuous"),
            Self::EventDriven => write!(f, "event_driven"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_demand" => Ok(Self::OnDemand),
            "scheduled" => Ok(Self::Scheduled),
            "continuous" => Ok(Self::Continuous),
            "event_driven" => Ok(Self::EventDriven),
            _ => Err(format!("Invalid execution mode: {s}")),
        }
    }
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_enabled() -> bool {
    true
}

/// Language-model capability a worker executes with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl CapabilitySpec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            system_prompt: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Secret holding the provider API key, e.g. `ANTHROPIC_API_KEY`
    pub fn secret_key(&self) -> String {
        format!("{}_API_KEY", self.provider.to_uppercase())
    }
}

/// Worker definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub worker_type: WorkerType,
    pub execution_mode: ExecutionMode,
    pub capability: CapabilitySpec,
    #[serde(default)]
    pub event_subscriptions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl WorkerConfig {
    /// Enabled worker with no subscriptions, tags or description
    pub fn new(
        name: impl Into<String>,
        worker_type: WorkerType,
        execution_mode: ExecutionMode,
        capability: CapabilitySpec,
    ) -> Self {
        Self {
            name: name.into(),
            worker_type,
            execution_mode,
            capability,
            event_subscriptions: Vec::new(),
            tags: Vec::new(),
            description: None,
            enabled: true,
        }
    }

    pub fn with_subscriptions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_subscriptions = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Runs in the persistent runner regardless of its declared type
    pub fn is_continuous(&self) -> bool {
        self.execution_mode == ExecutionMode::Continuous
            || self.worker_type == WorkerType::Continuous
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid =
            |reason: String| ConfigurationError::invalid_worker_config(&self.name, reason);

        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(format!(
                "name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            )));
        }
        if self.capability.provider.trim().is_empty() {
            return Err(invalid("capability provider must not be empty".to_string()));
        }
        if self.capability.model.trim().is_empty() {
            return Err(invalid("capability model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.capability.temperature) {
            return Err(invalid(format!(
                "temperature {} outside [0.0, 2.0]",
                self.capability.temperature
            )));
        }
        for pattern in &self.event_subscriptions {
            validate_pattern(pattern)
                .map_err(|reason| invalid(format!("subscription '{pattern}': {reason}")))?;
        }
        Ok(())
    }
}
