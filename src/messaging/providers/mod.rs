//! # Broker Providers
//!
//! Concrete implementations of the [`Broker`](super::broker::Broker) trait.
//!
//! ## Providers
//!
//! - [`InMemoryBroker`] - In-process exchanges and queues for tests and development
//! - `RabbitMqBroker` - RabbitMQ via the lapin crate (`rabbitmq` feature)

mod in_memory;
#[cfg(feature = "rabbitmq")]
mod rabbitmq;

pub use in_memory::{InMemoryBroker, InMemoryBrokerStats, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER};
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqBroker;
