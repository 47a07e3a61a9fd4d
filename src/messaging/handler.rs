//! # Event Handlers
//!
//! The delivery loop hands each decoded [`Event`] to an [`EventHandler`]. A
//! handler returns `Ok(())` to acknowledge the message or a [`HandlerError`]
//! to have the bus requeue or dead-letter it.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

use crate::events::Event;

/// Failure reported by an event handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<crate::pools::PoolError> for HandlerError {
    fn from(err: crate::pools::PoolError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<crate::orchestration::OrchestrationError> for HandlerError {
    fn from(err: crate::orchestration::OrchestrationError) -> Self {
        Self::new(err.to_string())
    }
}

/// Consumer-side processing of bus events
///
/// Handlers must be idempotent: the bus delivers at least once and
/// redelivers unacknowledged messages after reconnects.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "event_handler"
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F, Fut> {
    name: String,
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Build a handler from an async closure
///
/// ```
/// use agentrunner_core::messaging::handler_fn;
///
/// let handler = handler_fn("printer", |event| async move {
///     println!("received {}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self.func)(event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, Fut> std::fmt::Debug for FnHandler<F, Fut> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}
