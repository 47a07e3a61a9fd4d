#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # AgentRunner Core
//!
//! Event-driven runtime for named workers backed by pluggable capabilities.
//!
//! ## Overview
//!
//! Workers are declared in a [`registry::WorkerDirectory`] and owned by the
//! [`orchestration::WorkerOrchestrator`], which drives their lifecycle,
//! watches their heartbeats and routes invocations onto a topic message bus.
//! Three execution pools consume that traffic:
//!
//! - [`pools::IsolatedPool`]: stateless tasks, round-robin instances, bounded retries
//! - [`pools::PlanningPool`]: multi-step collaborative plans with clarification pauses
//! - [`pools::PersistentRunner`]: long-lived workers with checkpointed conversation state
//!
//! ## Module Organization
//!
//! - [`messaging`] - Topic bus, broker providers and event handlers
//! - [`events`] - Event envelope and topic matching
//! - [`orchestration`] - Worker registry, lifecycle, health and routing
//! - [`pools`] - Execution pools
//! - [`capability`] - Capability, factory and planner seams
//! - [`state`] - State store seam and in-memory implementation
//! - [`registry`] - Worker directory
//! - [`models`] - Worker definitions, tasks, plans and conversation state
//! - [`state_machine`] - Worker, plan, task and step statuses
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentrunner_core::config::ConfigManager;
//! use agentrunner_core::messaging::MessageBus;
//! use agentrunner_core::orchestration::WorkerOrchestrator;
//! use agentrunner_core::registry::InMemoryWorkerDirectory;
//! use agentrunner_core::state::InMemoryStateStore;
//!
//! # async fn example() -> agentrunner_core::Result<()> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! agentrunner_core::logging::init_tracing(&config.logging);
//!
//! let bus = Arc::new(MessageBus::from_config(config.bus.clone())?);
//! bus.connect().await?;
//!
//! let orchestrator = WorkerOrchestrator::new(
//!     config.orchestrator.clone(),
//!     bus,
//!     Arc::new(InMemoryWorkerDirectory::new()),
//!     Arc::new(InMemoryStateStore::new()),
//! );
//! orchestrator.initialize().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod capability;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod pools;
pub mod registry;
pub mod state;
pub mod state_machine;
pub mod test_utils;

pub use config::AgentRunnerConfig;
pub use error::{AgentRunnerError, Result};
pub use events::{Event, EventType, Payload};
pub use messaging::MessageBus;
pub use orchestration::WorkerOrchestrator;
pub use pools::{IsolatedPool, PersistentRunner, PlanningPool};
