//! # Message Bus
//!
//! Topic-routed publish/subscribe over a [`BrokerProvider`].
//!
//! ## Delivery Contract
//!
//! - **At Least Once**: every delivery is acknowledged only after the handler
//!   returns `Ok`; in-flight messages are redelivered after a reconnect
//! - **Bounded Requeue**: a failing handler gets the message back while the
//!   broker's retry count is below `max_delivery_retries`, then the message is
//!   rejected to `dlq.{queue}` (or dropped when the DLQ is disabled)
//! - **Poison Messages**: bodies that do not decode to an [`Event`] are
//!   dead-lettered without reaching the handler
//! - **Fail-Fast Publish**: a disconnected bus gets one bounded reconnect
//!   attempt per publish, never a retry loop
//!
//! Consumer loops run as spawned tasks under a child [`CancellationToken`] of
//! the bus, back off by `reconnect_delay` on connection errors and replay the
//! recorded topology before resuming.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{
    Binding, BrokerProvider, Delivery, ExchangeDeclaration, ExchangeKind, MessageProperties,
    QueueArguments, QueueDeclaration, QueueInfo,
};
use super::errors::{MessagingError, MessagingResult};
use super::handler::{EventHandler, HandlerError};
use super::topology::Topology;
use crate::config::{BrokerKind, BusConfig};
use crate::constants::queues;
use crate::events::{validate_pattern, Event};

/// Per-subscription delivery options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Settle messages on delivery; handler errors are only logged
    pub auto_ack: bool,
    /// Declare `dlq.{queue}` and dead-letter rejected messages into it
    pub enable_dlq: bool,
    /// Queue-level message TTL (`x-message-ttl`)
    pub ttl_ms: Option<u64>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            enable_dlq: true,
            ttl_ms: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn without_dlq(mut self) -> Self {
        self.enable_dlq = false;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

struct Subscription {
    queue: String,
    patterns: Vec<String>,
    handler: Arc<dyn EventHandler>,
    options: SubscriptionOptions,
}

struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    handled: AtomicU64,
    handler_errors: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    poison: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time bus counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub publish_failures: u64,
    pub handled: u64,
    pub handler_errors: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub poison: u64,
    pub reconnects: u64,
}

/// Bus health report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusHealth {
    /// `healthy` or `unhealthy`
    pub status: String,
    pub connected: bool,
    pub provider: String,
    pub exchange: String,
    pub subscriptions: usize,
    pub active_consumers: usize,
}

/// Topic-routed message bus
pub struct MessageBus {
    config: BusConfig,
    broker: BrokerProvider,
    topology: Topology,
    subscriptions: DashMap<String, Arc<Subscription>>,
    consumers: DashMap<String, ConsumerHandle>,
    shutdown: CancellationToken,
    reconnect_lock: tokio::sync::Mutex<()>,
    counters: BusCounters,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("provider", &self.broker.provider_name())
            .field("exchange", &self.config.exchange)
            .field("subscriptions", &self.subscriptions.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

impl MessageBus {
    pub fn new(config: BusConfig, broker: BrokerProvider) -> Self {
        Self {
            config,
            broker,
            topology: Topology::new(),
            subscriptions: DashMap::new(),
            consumers: DashMap::new(),
            shutdown: CancellationToken::new(),
            reconnect_lock: tokio::sync::Mutex::new(()),
            counters: BusCounters::default(),
        }
    }

    /// Build a bus with the provider named in the configuration
    pub fn from_config(config: BusConfig) -> MessagingResult<Self> {
        let broker = match config.provider {
            BrokerKind::InMemory => BrokerProvider::in_memory(),
            #[cfg(feature = "rabbitmq")]
            BrokerKind::Rabbitmq => BrokerProvider::RabbitMq(Arc::new(
                super::providers::RabbitMqBroker::new(config.clone()),
            )),
            #[cfg(not(feature = "rabbitmq"))]
            BrokerKind::Rabbitmq => {
                return Err(MessagingError::configuration(
                    "bus",
                    "the rabbitmq provider requires the `rabbitmq` cargo feature",
                ))
            }
        };
        Ok(Self::new(config, broker))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn broker(&self) -> &BrokerProvider {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Connect and declare the main topic exchange and the dead-letter exchange
    pub async fn connect(&self) -> MessagingResult<()> {
        self.connect_broker().await?;

        let exchanges = [
            ExchangeDeclaration::durable(&self.config.exchange, ExchangeKind::Topic),
            ExchangeDeclaration::durable(&self.config.dead_letter_exchange, ExchangeKind::Direct),
        ];
        for exchange in &exchanges {
            self.broker.declare_exchange(exchange).await?;
            self.topology.record_exchange(exchange);
        }

        info!(
            provider = self.broker.provider_name(),
            exchange = %self.config.exchange,
            dead_letter_exchange = %self.config.dead_letter_exchange,
            "📡 BUS: Connected"
        );
        Ok(())
    }

    async fn connect_broker(&self) -> MessagingResult<()> {
        let timeout = self.config.connection_timeout();
        tokio::time::timeout(timeout, self.broker.connect())
            .await
            .map_err(|_| MessagingError::timeout("connect", timeout.as_millis() as u64))?
    }

    /// Reconnect if needed and replay the recorded topology
    pub async fn reestablish(&self) -> MessagingResult<()> {
        let _guard = self.reconnect_lock.lock().await;

        if !self.broker.is_connected() {
            self.connect_broker().await?;
        }
        self.topology.replay(&self.broker).await?;
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);

        info!(provider = self.broker.provider_name(), "📡 BUS: Connection re-established");
        Ok(())
    }

    async fn ensure_connected(&self) -> MessagingResult<()> {
        if self.broker.is_connected() {
            return Ok(());
        }
        let timeout = self.config.connection_timeout();
        tokio::time::timeout(timeout, self.reestablish())
            .await
            .map_err(|_| MessagingError::timeout("reconnect", timeout.as_millis() as u64))?
    }

    /// Declare `queue`, bind it to every pattern and register its handler
    ///
    /// Subscribing again replaces the handler and options for future consumer
    /// starts; bindings only accumulate.
    pub async fn subscribe<I, S>(
        &self,
        queue: &str,
        patterns: I,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> MessagingResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        for pattern in &patterns {
            validate_pattern(pattern)
                .map_err(|reason| MessagingError::invalid_pattern(pattern, reason))?;
        }

        self.ensure_connected().await?;

        let mut arguments = QueueArguments {
            message_ttl_ms: options.ttl_ms,
            ..QueueArguments::default()
        };

        if options.enable_dlq {
            let dlq_name = queues::dead_letter_queue(queue);
            let dlq = QueueDeclaration::durable(&dlq_name);
            let dlq_binding = Binding::new(&dlq_name, &self.config.dead_letter_exchange, &dlq_name);
            self.broker.declare_queue(&dlq).await?;
            self.broker.bind_queue(&dlq_binding).await?;
            self.topology.record_queue(&dlq);
            self.topology.record_binding(&dlq_binding);

            arguments.dead_letter_exchange = Some(self.config.dead_letter_exchange.clone());
            arguments.dead_letter_routing_key = Some(dlq_name);
        }

        let declaration = QueueDeclaration::durable(queue).with_arguments(arguments);
        self.broker.declare_queue(&declaration).await?;
        self.topology.record_queue(&declaration);

        for pattern in &patterns {
            let binding = Binding::new(queue, &self.config.exchange, pattern);
            self.broker.bind_queue(&binding).await?;
            self.topology.record_binding(&binding);
        }

        info!(
            queue = %queue,
            patterns = ?patterns,
            handler = handler.name(),
            dlq = options.enable_dlq,
            "📡 BUS: Subscribed"
        );

        self.subscriptions.insert(
            queue.to_string(),
            Arc::new(Subscription {
                queue: queue.to_string(),
                patterns,
                handler,
                options,
            }),
        );
        Ok(())
    }

    /// Stop consuming `queue` and forget its handler; the queue itself stays
    /// declared
    pub async fn unsubscribe(&self, queue: &str) {
        self.stop_consuming(Some(queue)).await;
        self.subscriptions.remove(queue);
    }

    /// Publish an event; `false` (with the error logged) when it could not be
    /// handed to the broker
    pub async fn publish(&self, event: &Event, routing_key: Option<&str>) -> bool {
        match self.try_publish(event, routing_key).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    routing_key = routing_key.unwrap_or_default(),
                    error = %e,
                    "📡 BUS: Failed to publish event"
                );
                false
            }
        }
    }

    /// Publish an event, returning the failure
    pub async fn try_publish(
        &self,
        event: &Event,
        routing_key: Option<&str>,
    ) -> MessagingResult<()> {
        let result = self.publish_inner(event, routing_key).await;
        match &result {
            Ok(()) => self.counters.published.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.publish_failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn publish_inner(&self, event: &Event, routing_key: Option<&str>) -> MessagingResult<()> {
        self.ensure_connected().await?;

        let routing_key = routing_key
            .map(str::to_string)
            .unwrap_or_else(|| event.routing_key());
        let body = event.to_bytes()?;
        let properties = MessageProperties::persistent_json(event.id.to_string())
            .with_expiration_ms(event.ttl.map(|seconds| seconds.saturating_mul(1_000)));

        self.broker
            .publish(&self.config.exchange, &routing_key, &body, &properties)
            .await?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            routing_key = %routing_key,
            "Event published"
        );
        Ok(())
    }

    /// Start the delivery loop for a subscribed queue
    ///
    /// With `blocking` the call returns only once the consumer is stopped.
    /// Starting an already running consumer is a no-op.
    pub async fn start_consuming(
        self: &Arc<Self>,
        queue: &str,
        blocking: bool,
    ) -> MessagingResult<()> {
        let subscription = self
            .subscriptions
            .get(queue)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| MessagingError::subscription_not_found(queue))?;

        let token = match self.consumers.entry(queue.to_string()) {
            Entry::Occupied(existing) if !existing.get().task.is_finished() => {
                debug!(queue = %queue, "Consumer already running");
                existing.get().token.clone()
            }
            entry => {
                let token = self.shutdown.child_token();
                let task = tokio::spawn(Arc::clone(self).consume(subscription, token.clone()));
                entry.insert(ConsumerHandle {
                    token: token.clone(),
                    task,
                });
                token
            }
        };

        if blocking {
            token.cancelled().await;
        }
        Ok(())
    }

    /// Stop one consumer, or all of them when `queue` is `None`
    ///
    /// Waits up to `consumer_stop_timeout` for an in-flight handler to finish
    /// before aborting the task.
    pub async fn stop_consuming(&self, queue: Option<&str>) {
        let names: Vec<String> = match queue {
            Some(queue) => vec![queue.to_string()],
            None => self.consumers.iter().map(|c| c.key().clone()).collect(),
        };

        for name in names {
            let Some((_, mut handle)) = self.consumers.remove(&name) else {
                continue;
            };
            handle.token.cancel();

            let timeout = self.config.consumer_stop_timeout();
            if tokio::time::timeout(timeout, &mut handle.task).await.is_err() {
                warn!(
                    queue = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "📡 BUS: Consumer did not stop in time, aborting"
                );
                handle.task.abort();
            } else {
                debug!(queue = %name, "Consumer stopped");
            }
        }
    }

    pub fn is_consuming(&self, queue: &str) -> bool {
        self.consumers
            .get(queue)
            .is_some_and(|c| !c.task.is_finished())
    }

    pub fn subscribed_queues(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.key().clone()).collect()
    }

    /// Patterns a queue was subscribed with
    pub fn subscription_patterns(&self, queue: &str) -> Option<Vec<String>> {
        self.subscriptions.get(queue).map(|s| s.patterns.clone())
    }

    pub async fn queue_info(&self, queue: &str) -> MessagingResult<Option<QueueInfo>> {
        self.ensure_connected().await?;
        self.broker.queue_info(queue).await
    }

    pub async fn purge_queue(&self, queue: &str) -> MessagingResult<u64> {
        self.ensure_connected().await?;
        let purged = self.broker.purge_queue(queue).await?;
        info!(queue = %queue, purged, "📡 BUS: Queue purged");
        Ok(purged)
    }

    pub fn health_check(&self) -> BusHealth {
        let connected = self.broker.is_connected();
        BusHealth {
            status: if connected { "healthy" } else { "unhealthy" }.to_string(),
            connected,
            provider: self.broker.provider_name().to_string(),
            exchange: self.config.exchange.clone(),
            subscriptions: self.subscriptions.len(),
            active_consumers: self
                .consumers
                .iter()
                .filter(|c| !c.task.is_finished())
                .count(),
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            handled: self.counters.handled.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            poison: self.counters.poison.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop every consumer and close the broker connection
    pub async fn close(&self) -> MessagingResult<()> {
        self.shutdown.cancel();
        self.stop_consuming(None).await;
        self.broker.close().await?;
        info!("📡 BUS: Closed");
        Ok(())
    }

    async fn consume(self: Arc<Self>, subscription: Arc<Subscription>, token: CancellationToken) {
        let queue = subscription.queue.as_str();
        if let Err(e) = self.broker.register_consumer(queue).await {
            debug!(queue = %queue, error = %e, "Consumer registration failed");
        }
        info!(queue = %queue, handler = subscription.handler.name(), "📡 BUS: Consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = self.broker.receive(queue, subscription.options.auto_ack) => received,
            };

            match received {
                Ok(delivery) => self.dispatch(&subscription, delivery).await,
                Err(e) => {
                    let recoverable =
                        e.is_connection_error()
                            || matches!(e, MessagingError::QueueNotFound { .. });
                    warn!(
                        queue = %queue,
                        error = %e,
                        reconnect_delay_ms = self.config.reconnect_delay_ms,
                        "📡 BUS: Receive failed"
                    );

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                    }

                    if recoverable {
                        if let Err(e) = self.reestablish().await {
                            warn!(queue = %queue, error = %e, "📡 BUS: Reconnect attempt failed");
                        }
                    }
                }
            }
        }

        if let Err(e) = self.broker.unregister_consumer(queue).await {
            debug!(queue = %queue, error = %e, "Consumer deregistration failed");
        }
        info!(queue = %queue, "📡 BUS: Consumer stopped");
    }

    async fn dispatch(&self, subscription: &Subscription, delivery: Delivery) {
        let queue = subscription.queue.as_str();
        let auto_ack = subscription.options.auto_ack;

        let mut event = match Event::from_bytes(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                self.counters.poison.fetch_add(1, Ordering::Relaxed);
                warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "📡 BUS: Undecodable message, dead-lettering"
                );
                if !auto_ack {
                    self.settle(queue, &delivery, Settlement::Reject).await;
                }
                return;
            }
        };
        event.retry_count = delivery.retry_count;
        let event_id = event.id;

        let outcome = AssertUnwindSafe(subscription.handler.handle(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::new(panic_message(panic.as_ref()))));

        match outcome {
            Ok(()) => {
                self.counters.handled.fetch_add(1, Ordering::Relaxed);
                if !auto_ack {
                    self.settle(queue, &delivery, Settlement::Ack).await;
                }
            }
            Err(e) => {
                self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                if auto_ack {
                    error!(
                        queue = %queue,
                        event_id = %event_id,
                        handler = subscription.handler.name(),
                        error = %e,
                        "📡 BUS: Handler failed on auto-acknowledged message"
                    );
                    return;
                }

                if delivery.retry_count < self.config.max_delivery_retries {
                    warn!(
                        queue = %queue,
                        event_id = %event_id,
                        retry_count = delivery.retry_count,
                        error = %e,
                        "📡 BUS: Handler failed, requeueing"
                    );
                    self.settle(queue, &delivery, Settlement::Requeue).await;
                } else {
                    error!(
                        queue = %queue,
                        event_id = %event_id,
                        retry_count = delivery.retry_count,
                        dlq = subscription.options.enable_dlq,
                        error = %e,
                        "📡 BUS: Handler retries exhausted, rejecting"
                    );
                    self.settle(queue, &delivery, Settlement::Reject).await;
                }
            }
        }
    }

    async fn settle(&self, queue: &str, delivery: &Delivery, settlement: Settlement) {
        let result = match settlement {
            Settlement::Ack => self.broker.ack(queue, delivery.delivery_tag).await,
            Settlement::Requeue => self.broker.nack(queue, delivery.delivery_tag, true).await,
            Settlement::Reject => self.broker.nack(queue, delivery.delivery_tag, false).await,
        };

        match result {
            Ok(()) => match settlement {
                Settlement::Requeue => {
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Settlement::Reject => {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
                Settlement::Ack => {}
            },
            // The broker redelivers unsettled messages after a reconnect
            Err(e) => warn!(
                queue = %queue,
                delivery_tag = delivery.delivery_tag,
                settlement = ?settlement,
                error = %e,
                "📡 BUS: Failed to settle delivery"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
