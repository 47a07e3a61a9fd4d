//! # Messaging Module
//!
//! Topic-routed event bus for worker orchestration: a [`MessageBus`] over a
//! pluggable [`BrokerProvider`] (in-memory or RabbitMQ), consumer handlers,
//! dead-lettering and reconnect with topology replay.

pub mod broker;
pub mod bus;
pub mod errors;
pub mod handler;
pub mod providers;
pub mod topology;

pub use broker::{
    Binding, Broker, BrokerProvider, Delivery, ExchangeDeclaration, ExchangeKind,
    MessageProperties, QueueArguments, QueueDeclaration, QueueInfo,
};
pub use bus::{BusHealth, BusStats, MessageBus, SubscriptionOptions};
pub use errors::{MessagingError, MessagingResult};
pub use handler::{handler_fn, EventHandler, FnHandler, HandlerError};
pub use providers::InMemoryBroker;
