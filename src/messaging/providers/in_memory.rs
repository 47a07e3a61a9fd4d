//! # In-Memory Broker
//!
//! Thread-safe in-process broker for tests and development.
//!
//! ## Features
//!
//! - **Topic and Direct Exchanges**: same routing rules as RabbitMQ
//! - **Dead Lettering**: rejected and expired messages go to the queue's
//!   `x-dead-letter-exchange` with its `x-dead-letter-routing-key`
//! - **Delivery Counting**: every unacknowledged delivery bumps the message's
//!   delivery count, reported to consumers as `retry_count`
//! - **Failure Simulation**: connection loss and full topology loss for
//!   exercising reconnect paths

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{topic_matches, Event};
use crate::messaging::broker::{
    Binding, Broker, Delivery, ExchangeDeclaration, ExchangeKind, MessageProperties,
    QueueDeclaration, QueueInfo,
};
use crate::messaging::errors::{MessagingError, MessagingResult};

/// Header set on dead-lettered messages with the reason (`rejected`, `expired`)
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Header set on dead-lettered messages with the queue they died in
pub const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    delivery_count: u32,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    consumers: u32,
}

impl QueueState {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            messages: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            consumers: 0,
        }
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Debug, Default)]
struct BrokerCounters {
    published: AtomicU64,
    unroutable: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InMemoryBrokerStats {
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
    pub expired: u64,
}

/// In-process AMQP-style broker
///
/// # Example
///
/// ```rust
/// use agentrunner_core::messaging::broker::{
///     Binding, Broker, ExchangeDeclaration, ExchangeKind, MessageProperties, QueueDeclaration,
/// };
/// use agentrunner_core::messaging::providers::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.connect().await?;
/// broker
///     .declare_exchange(&ExchangeDeclaration::durable("events", ExchangeKind::Topic))
///     .await?;
/// broker.declare_queue(&QueueDeclaration::durable("audit")).await?;
/// broker.bind_queue(&Binding::new("audit", "events", "task.#")).await?;
///
/// broker
///     .publish("events", "task.completed", b"{}", &MessageProperties::default())
///     .await?;
/// let delivery = broker.receive("audit", false).await?;
/// broker.ack("audit", delivery.delivery_tag).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    refuse_connections: AtomicBool,
    next_delivery_tag: AtomicU64,
    counters: BrokerCounters,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a disconnected broker with no topology
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            connected: AtomicBool::new(false),
            refuse_connections: AtomicBool::new(false),
            next_delivery_tag: AtomicU64::new(1),
            counters: BrokerCounters::default(),
        }
    }

    /// Drop the connection: in-flight deliveries return to the head of their
    /// queues and blocked receivers fail with a connection error
    pub fn simulate_connection_loss(&self) {
        self.connected.store(false, Ordering::SeqCst);

        let mut state = self.state.lock();
        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(Unacked { queue, mut message }) = state.unacked.remove(&tag) {
                message.delivery_count += 1;
                if let Some(queue_state) = state.queues.get_mut(&queue) {
                    queue_state.messages.push_front(message);
                }
            }
        }

        for queue_state in state.queues.values_mut() {
            queue_state.consumers = 0;
            queue_state.notify.notify_waiters();
            queue_state.notify.notify_one();
        }

        warn!("🐇 BROKER: Simulated connection loss");
    }

    /// Replace the broker node: every exchange, queue, binding and message is
    /// gone and the connection is dropped
    pub fn reset_topology(&self) {
        self.connected.store(false, Ordering::SeqCst);

        let mut state = self.state.lock();
        for queue_state in state.queues.values() {
            queue_state.notify.notify_waiters();
            queue_state.notify.notify_one();
        }
        *state = BrokerState::default();

        warn!("🐇 BROKER: Simulated topology loss");
    }

    /// Make `connect` fail until cleared
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Number of ready messages in a queue (for testing)
    pub fn queue_length(&self, queue_name: &str) -> usize {
        let mut state = self.state.lock();
        self.expire_messages(&mut state, queue_name);
        state
            .queues
            .get(queue_name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Decoded events waiting in a queue, oldest first (for testing)
    pub fn queued_events(&self, queue_name: &str) -> Vec<Event> {
        let state = self.state.lock();
        state
            .queues
            .get(queue_name)
            .map(|q| {
                q.messages
                    .iter()
                    .filter_map(|m| Event::from_bytes(&m.body).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Headers of the messages waiting in a queue, oldest first (for testing)
    pub fn queued_headers(&self, queue_name: &str) -> Vec<HashMap<String, String>> {
        let state = self.state.lock();
        state
            .queues
            .get(queue_name)
            .map(|q| {
                q.messages
                    .iter()
                    .map(|m| m.properties.headers.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn queue_exists(&self, queue_name: &str) -> bool {
        self.state.lock().queues.contains_key(queue_name)
    }

    /// Routing keys bound to a queue on an exchange
    pub fn bindings_for(&self, queue_name: &str, exchange: &str) -> Vec<String> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue_name && b.exchange == exchange)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn stats(&self) -> InMemoryBrokerStats {
        InMemoryBrokerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            unroutable: self.counters.unroutable.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            nacked: self.counters.nacked.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    fn ensure_connected(&self) -> MessagingResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::connection("in-memory broker is not connected"))
        }
    }

    /// Route a message into every matching queue; returns the number of copies
    fn route(state: &mut BrokerState, message: StoredMessage, now: Instant) -> usize {
        let Some(exchange) = state.exchanges.get(&message.exchange) else {
            return 0;
        };
        let kind = exchange.kind;

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == message.exchange) {
            let matched = match kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                ExchangeKind::Direct => binding.routing_key == message.routing_key,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        let mut routed = 0;
        for queue_name in targets {
            if let Some(queue_state) = state.queues.get_mut(&queue_name) {
                let mut copy = message.clone();
                copy.expires_at = expiry(
                    now,
                    copy.properties.expiration_ms,
                    queue_state.declaration.arguments.message_ttl_ms,
                );
                queue_state.messages.push_back(copy);
                queue_state.notify.notify_one();
                routed += 1;
            }
        }
        routed
    }

    /// Move a message out of `queue_name` to its dead-letter exchange, or drop
    /// it when the queue has none
    fn dead_letter(
        &self,
        state: &mut BrokerState,
        queue_name: &str,
        mut message: StoredMessage,
        reason: &str,
        now: Instant,
    ) {
        let arguments = match state.queues.get(queue_name) {
            Some(q) => q.declaration.arguments.clone(),
            None => return,
        };
        let Some(dead_letter_exchange) = arguments.dead_letter_exchange else {
            debug!(
                queue = %queue_name,
                reason = %reason,
                "Message discarded, queue has no dead-letter exchange"
            );
            return;
        };

        message
            .properties
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
        message
            .properties
            .headers
            .entry(DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| queue_name.to_string());
        message.properties.expiration_ms = None;
        message.delivery_count = 0;
        if let Some(routing_key) = arguments.dead_letter_routing_key {
            message.routing_key = routing_key;
        }
        message.exchange = dead_letter_exchange;

        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if Self::route(state, message, now) == 0 {
            warn!(queue = %queue_name, "Dead-lettered message was unroutable and has been dropped");
        }
    }

    fn expire_messages(&self, state: &mut BrokerState, queue_name: &str) {
        let now = Instant::now();
        loop {
            let expired = match state.queues.get_mut(queue_name) {
                Some(q) => match q.messages.front() {
                    Some(front) if front.expires_at.is_some_and(|at| at <= now) => {
                        q.messages.pop_front()
                    }
                    _ => None,
                },
                None => None,
            };
            match expired {
                Some(message) => {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    self.dead_letter(state, queue_name, message, "expired", now);
                }
                None => break,
            }
        }
    }

    fn take_unacked(
        state: &mut BrokerState,
        queue_name: &str,
        delivery_tag: u64,
    ) -> MessagingResult<StoredMessage> {
        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.queue == queue_name => {}
            _ => return Err(MessagingError::unknown_delivery(queue_name, delivery_tag)),
        }
        state
            .unacked
            .remove(&delivery_tag)
            .map(|u| u.message)
            .ok_or_else(|| MessagingError::unknown_delivery(queue_name, delivery_tag))
    }
}

fn expiry(now: Instant, message_ttl_ms: Option<u64>, queue_ttl_ms: Option<u64>) -> Option<Instant> {
    let ttl = match (message_ttl_ms, queue_ttl_ms) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    ttl.map(|ms| now + Duration::from_millis(ms))
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> MessagingResult<()> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(MessagingError::connection("connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> MessagingResult<()> {
        self.simulate_connection_loss();
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => Err(MessagingError::channel(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                exchange.name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        match state.queues.get(&queue.name) {
            Some(existing) if existing.declaration.arguments != queue.arguments => {
                Err(MessagingError::channel(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(MessagingError::exchange_not_found(&binding.exchange));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(MessagingError::queue_not_found(&binding.queue));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::exchange_not_found(exchange));
        }

        let mut properties = properties.clone();
        properties.timestamp.get_or_insert_with(Utc::now);

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties,
            delivery_count: 0,
            expires_at: None,
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        if Self::route(&mut state, message, Instant::now()) == 0 {
            self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }
        Ok(())
    }

    async fn receive(&self, queue: &str, auto_ack: bool) -> MessagingResult<Delivery> {
        loop {
            let notify = {
                self.ensure_connected()?;
                let mut state = self.state.lock();
                if !state.queues.contains_key(queue) {
                    return Err(MessagingError::queue_not_found(queue));
                }
                self.expire_messages(&mut state, queue);

                let queue_state = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| MessagingError::queue_not_found(queue))?;

                match queue_state.messages.pop_front() {
                    Some(message) => {
                        let delivery_tag = self.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
                        let delivery = Delivery {
                            delivery_tag,
                            queue: queue.to_string(),
                            exchange: message.exchange.clone(),
                            routing_key: message.routing_key.clone(),
                            body: message.body.clone(),
                            properties: message.properties.clone(),
                            redelivered: message.delivery_count > 0,
                            retry_count: message.delivery_count,
                        };
                        if !auto_ack {
                            state.unacked.insert(
                                delivery_tag,
                                Unacked {
                                    queue: queue.to_string(),
                                    message,
                                },
                            );
                        }
                        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        return Ok(delivery);
                    }
                    None => queue_state.notify.clone(),
                }
            };

            notify.notified().await;
        }
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        Self::take_unacked(&mut state, queue, delivery_tag)?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let mut message = Self::take_unacked(&mut state, queue, delivery_tag)?;
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);

        if requeue {
            message.delivery_count += 1;
            if let Some(queue_state) = state.queues.get_mut(queue) {
                queue_state.messages.push_front(message);
                queue_state.notify.notify_one();
            }
        } else {
            self.dead_letter(&mut state, queue, message, "rejected", Instant::now());
        }
        Ok(())
    }

    async fn queue_info(&self, queue: &str) -> MessagingResult<Option<QueueInfo>> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        self.expire_messages(&mut state, queue);
        Ok(state.queues.get(queue).map(|q| QueueInfo {
            queue: queue.to_string(),
            message_count: q.messages.len() as u64,
            consumer_count: q.consumers,
        }))
    }

    async fn purge_queue(&self, queue: &str) -> MessagingResult<u64> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;
        let purged = queue_state.messages.len() as u64;
        queue_state.messages.clear();
        Ok(purged)
    }

    async fn register_consumer(&self, queue: &str) -> MessagingResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;
        queue_state.consumers += 1;
        Ok(())
    }

    async fn unregister_consumer(&self, queue: &str) -> MessagingResult<()> {
        let mut state = self.state.lock();
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.consumers = queue_state.consumers.saturating_sub(1);
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
