//! # Crate Error Type
//!
//! Every component has its own error enum; [`AgentRunnerError`] collects them
//! for callers that drive several components at once.

use thiserror::Error;

use crate::capability::CapabilityError;
use crate::config::ConfigurationError;
use crate::messaging::{HandlerError, MessagingError};
use crate::orchestration::OrchestrationError;
use crate::pools::PoolError;
use crate::state::StateStoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentRunnerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

pub type Result<T> = std::result::Result<T, AgentRunnerError>;
