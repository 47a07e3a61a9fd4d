//! # Broker Abstraction
//!
//! The AMQP-shaped surface the [`MessageBus`](super::MessageBus) needs from a
//! broker: exchanges, queues with dead-letter arguments, bindings, publish,
//! receive and acknowledgement. Providers implement [`Broker`]; the bus holds
//! a [`BrokerProvider`] and dispatches through the enum.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::errors::MessagingResult;
use super::providers::InMemoryBroker;
#[cfg(feature = "rabbitmq")]
use super::providers::RabbitMqBroker;

/// Exchange routing discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Pattern routing with `*` / `#` wildcards
    Topic,
    /// Exact routing key match
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic => write!(f, "topic"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDeclaration {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Optional queue arguments (`x-dead-letter-*`, `x-message-ttl`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

impl QueueDeclaration {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: QueueArguments::default(),
        }
    }

    pub fn with_arguments(mut self, arguments: QueueArguments) -> Self {
        self.arguments = arguments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Basic message properties carried alongside the body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Delivery mode 2 (survives broker restarts on durable queues)
    pub persistent: bool,
    /// Per-message expiration
    pub expiration_ms: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: HashMap<String, String>,
}

impl MessageProperties {
    /// Persistent JSON message properties
    pub fn persistent_json(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            content_type: Some("application/json".to_string()),
            persistent: true,
            expiration_ms: None,
            timestamp: Some(Utc::now()),
            headers: HashMap::new(),
        }
    }

    pub fn with_expiration_ms(mut self, expiration_ms: Option<u64>) -> Self {
        self.expiration_ms = expiration_ms;
        self
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    /// Number of earlier deliveries of this message that were not acknowledged
    pub retry_count: u32,
}

/// Queue depth and consumer information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u64,
    pub consumer_count: u32,
}

/// Operations a broker provider must support
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open (or re-open) the connection
    async fn connect(&self) -> MessagingResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> MessagingResult<()>;

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> MessagingResult<()>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> MessagingResult<()>;

    async fn bind_queue(&self, binding: &Binding) -> MessagingResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> MessagingResult<()>;

    /// Wait for the next message on a queue
    ///
    /// With `auto_ack` the broker considers the message settled on delivery.
    async fn receive(&self, queue: &str, auto_ack: bool) -> MessagingResult<Delivery>;

    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()>;

    /// Reject a message; without `requeue` it is dead-lettered (or dropped
    /// when the queue has no dead-letter exchange)
    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()>;

    /// `None` when the queue does not exist
    async fn queue_info(&self, queue: &str) -> MessagingResult<Option<QueueInfo>>;

    async fn purge_queue(&self, queue: &str) -> MessagingResult<u64>;

    async fn register_consumer(&self, _queue: &str) -> MessagingResult<()> {
        Ok(())
    }

    async fn unregister_consumer(&self, _queue: &str) -> MessagingResult<()> {
        Ok(())
    }

    fn provider_name(&self) -> &'static str;
}

/// Provider enum for dispatch without trait objects
#[derive(Debug, Clone)]
pub enum BrokerProvider {
    /// In-process broker (tests and development)
    InMemory(Arc<InMemoryBroker>),
    /// RabbitMQ over AMQP 0.9.1
    #[cfg(feature = "rabbitmq")]
    RabbitMq(Arc<RabbitMqBroker>),
}

macro_rules! dispatch {
    ($self:ident, $broker:ident => $call:expr) => {
        match $self {
            Self::InMemory($broker) => $call,
            #[cfg(feature = "rabbitmq")]
            Self::RabbitMq($broker) => $call,
        }
    };
}

impl BrokerProvider {
    pub fn in_memory() -> Self {
        Self::InMemory(Arc::new(InMemoryBroker::new()))
    }

    pub fn provider_name(&self) -> &'static str {
        dispatch!(self, b => b.provider_name())
    }

    pub fn is_connected(&self) -> bool {
        dispatch!(self, b => b.is_connected())
    }

    pub async fn connect(&self) -> MessagingResult<()> {
        dispatch!(self, b => b.connect().await)
    }

    pub async fn close(&self) -> MessagingResult<()> {
        dispatch!(self, b => b.close().await)
    }

    pub async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> MessagingResult<()> {
        dispatch!(self, b => b.declare_exchange(exchange).await)
    }

    pub async fn declare_queue(&self, queue: &QueueDeclaration) -> MessagingResult<()> {
        dispatch!(self, b => b.declare_queue(queue).await)
    }

    pub async fn bind_queue(&self, binding: &Binding) -> MessagingResult<()> {
        dispatch!(self, b => b.bind_queue(binding).await)
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> MessagingResult<()> {
        dispatch!(self, b => b.publish(exchange, routing_key, body, properties).await)
    }

    pub async fn receive(&self, queue: &str, auto_ack: bool) -> MessagingResult<Delivery> {
        dispatch!(self, b => b.receive(queue, auto_ack).await)
    }

    pub async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        dispatch!(self, b => b.ack(queue, delivery_tag).await)
    }

    pub async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        dispatch!(self, b => b.nack(queue, delivery_tag, requeue).await)
    }

    pub async fn queue_info(&self, queue: &str) -> MessagingResult<Option<QueueInfo>> {
        dispatch!(self, b => b.queue_info(queue).await)
    }

    pub async fn purge_queue(&self, queue: &str) -> MessagingResult<u64> {
        dispatch!(self, b => b.purge_queue(queue).await)
    }

    pub async fn register_consumer(&self, queue: &str) -> MessagingResult<()> {
        dispatch!(self, b => b.register_consumer(queue).await)
    }

    pub async fn unregister_consumer(&self, queue: &str) -> MessagingResult<()> {
        dispatch!(self, b => b.unregister_consumer(queue).await)
    }
}

impl From<Arc<InMemoryBroker>> for BrokerProvider {
    fn from(broker: Arc<InMemoryBroker>) -> Self {
        Self::InMemory(broker)
    }
}
