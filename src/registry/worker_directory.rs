//! # Worker Directory
//!
//! The configuration collaborator: where worker definitions and their
//! secrets come from. The orchestrator reads it at startup and reconciles
//! against it on every health tick; pools use it to resolve API keys.
//!
//! ## Usage
//!
//! ```rust
//! use agentrunner_core::models::{CapabilitySpec, ExecutionMode, WorkerConfig, WorkerType};
//! use agentrunner_core::registry::{InMemoryWorkerDirectory, WorkerDirectory};
//!
//! # tokio_test::block_on(async {
//! let directory = InMemoryWorkerDirectory::new();
//! directory
//!     .upsert(WorkerConfig::new(
//!         "summarizer",
//!         WorkerType::Autonomous,
//!         ExecutionMode::OnDemand,
//!         CapabilitySpec::new("anthropic", "claude"),
//!     ))
//!     .await;
//! directory.set_secret("ANTHROPIC_API_KEY", "sk-test").await;
//!
//! let enabled = directory.enabled_workers().await.unwrap();
//! assert_eq!(enabled.len(), 1);
//! # });
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{ConfigResult, ConfigurationError};
use crate::models::{WorkerConfig, WorkerType};

/// Source of worker definitions and secrets
#[async_trait]
pub trait WorkerDirectory: Send + Sync + 'static {
    /// Every enabled worker
    async fn enabled_workers(&self) -> ConfigResult<Vec<WorkerConfig>>;

    /// A worker by name, enabled or not
    async fn worker(&self, name: &str) -> ConfigResult<Option<WorkerConfig>>;

    /// Enabled workers of one type
    async fn workers_by_type(&self, worker_type: WorkerType) -> ConfigResult<Vec<WorkerConfig>> {
        Ok(self
            .enabled_workers()
            .await?
            .into_iter()
            .filter(|w| w.worker_type == worker_type)
            .collect())
    }

    async fn get_secret(&self, key: &str) -> Option<String>;
}

/// Directory held in memory; secrets fall back to the process environment
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkerDirectory {
    workers: Arc<RwLock<HashMap<String, WorkerConfig>>>,
    secrets: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryWorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of configs, validating each
    pub fn from_configs(configs: Vec<WorkerConfig>) -> ConfigResult<Self> {
        let mut workers = HashMap::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            if workers.contains_key(&config.name) {
                return Err(ConfigurationError::invalid_worker_config(
                    &config.name,
                    "duplicate worker name",
                ));
            }
            workers.insert(config.name.clone(), config);
        }
        Ok(Self {
            workers: Arc::new(RwLock::new(workers)),
            secrets: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Insert or replace a worker definition
    pub async fn upsert(&self, config: WorkerConfig) {
        debug!(worker = %config.name, enabled = config.enabled, "Worker definition stored");
        self.workers.write().await.insert(config.name.clone(), config);
    }

    pub async fn remove(&self, name: &str) -> Option<WorkerConfig> {
        self.workers.write().await.remove(name)
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.workers.write().await.get_mut(name) {
            Some(config) => {
                config.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn set_secret(&self, key: impl Into<String>, value: impl Into<String>) {
        self.secrets.write().await.insert(key.into(), value.into());
    }
}

#[async_trait]
impl WorkerDirectory for InMemoryWorkerDirectory {
    async fn enabled_workers(&self) -> ConfigResult<Vec<WorkerConfig>> {
        let workers = self.workers.read().await;
        let mut enabled: Vec<WorkerConfig> =
            workers.values().filter(|w| w.enabled).cloned().collect();
        enabled.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(enabled)
    }

    async fn worker(&self, name: &str) -> ConfigResult<Option<WorkerConfig>> {
        Ok(self.workers.read().await.get(name).cloned())
    }

    async fn get_secret(&self, key: &str) -> Option<String> {
        if let Some(value) = self.secrets.read().await.get(key) {
            return Some(value.clone());
        }
        std::env::var(key).ok()
    }
}
