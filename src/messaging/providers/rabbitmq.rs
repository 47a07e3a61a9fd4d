//! # RabbitMQ Broker
//!
//! [`Broker`] implementation over AMQP 0.9.1 using the `lapin` crate.
//!
//! ## Notes
//!
//! - **Polling Receive**: messages are pulled with `basic_get` and a short
//!   poll interval, so prefetch is bounded by the single in-flight delivery
//! - **Retry Counting**: classic queues only expose a `redelivered` flag, so
//!   requeue counts are tracked per `message_id` on this connection and
//!   combined with the quorum-queue `x-delivery-count` header when present
//! - **Passive Checks**: `queue_info` uses a throwaway channel because a
//!   failed passive declare closes the channel it ran on

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::messaging::broker::{
    Binding, Broker, Delivery, ExchangeDeclaration, ExchangeKind, MessageProperties,
    QueueDeclaration, QueueInfo,
};
use crate::messaging::errors::{MessagingError, MessagingResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

#[derive(Debug)]
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// RabbitMQ-backed broker
#[derive(Debug)]
pub struct RabbitMqBroker {
    config: BusConfig,
    session: RwLock<Option<AmqpSession>>,
    /// message_id -> requeues seen on this connection
    requeues: Mutex<HashMap<String, u32>>,
    /// delivery_tag -> message_id for unsettled deliveries
    in_flight: Mutex<HashMap<u64, Option<String>>>,
}

impl RabbitMqBroker {
    /// Create a broker handle; no connection is opened until [`Broker::connect`]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
            requeues: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn channel(&self) -> MessagingResult<Channel> {
        let session = self.session.read().await;
        match session.as_ref() {
            Some(s) if s.is_open() => Ok(s.channel.clone()),
            _ => Err(MessagingError::connection("RabbitMQ connection is not open")),
        }
    }

    fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        }
    }

    fn queue_arguments(queue: &QueueDeclaration) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(exchange) = &queue.arguments.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }
        if let Some(routing_key) = &queue.arguments.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.clone().into()),
            );
        }
        if let Some(ttl) = queue.arguments.message_ttl_ms {
            args.insert(
                "x-message-ttl".into(),
                AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
            );
        }
        args
    }

    fn basic_properties(properties: &MessageProperties) -> BasicProperties {
        let mut basic = BasicProperties::default();
        if properties.persistent {
            basic = basic.with_delivery_mode(2);
        }
        if let Some(content_type) = &properties.content_type {
            basic = basic.with_content_type(content_type.clone().into());
        }
        if let Some(message_id) = &properties.message_id {
            basic = basic.with_message_id(message_id.clone().into());
        }
        if let Some(expiration) = properties.expiration_ms {
            basic = basic.with_expiration(expiration.to_string().into());
        }
        if let Some(timestamp) = properties.timestamp {
            basic = basic.with_timestamp(u64::try_from(timestamp.timestamp()).unwrap_or_default());
        }
        if !properties.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in &properties.headers {
                headers.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
            }
            basic = basic.with_headers(headers);
        }
        basic
    }

    fn message_properties(basic: &BasicProperties) -> MessageProperties {
        let mut headers = HashMap::new();
        if let Some(table) = basic.headers() {
            for (key, value) in table.inner() {
                if let Some(text) = amqp_value_to_string(value) {
                    headers.insert(key.as_str().to_string(), text);
                }
            }
        }

        MessageProperties {
            message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
            content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
            persistent: *basic.delivery_mode() == Some(2),
            expiration_ms: basic
                .expiration()
                .as_ref()
                .and_then(|s| s.as_str().parse().ok()),
            timestamp: basic
                .timestamp()
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            headers,
        }
    }

    fn map_lapin_error(queue: &str, operation: &str, error: lapin::Error) -> MessagingError {
        let message = error.to_string();
        if message.contains("NOT_FOUND") {
            MessagingError::queue_not_found(queue)
        } else if matches!(
            error,
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
        ) {
            MessagingError::connection(format!("{operation} failed: {message}"))
        } else {
            MessagingError::channel(format!("{operation} on '{queue}' failed: {message}"))
        }
    }
}

fn amqp_value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn connect(&self) -> MessagingResult<()> {
        let mut session = self.session.write().await;
        if session.as_ref().is_some_and(AmqpSession::is_open) {
            return Ok(());
        }

        let connection = Connection::connect(
            &self.config.url,
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| {
                MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
            })?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| {
                MessagingError::configuration("rabbitmq", format!("Failed to set QoS: {e}"))
            })?;

        self.in_flight.lock().clear();
        *session = Some(AmqpSession {
            connection,
            channel,
        });

        info!(
            url = %self.config.url_redacted(),
            prefetch_count = self.config.prefetch_count,
            "🐇 BROKER: Connected to RabbitMQ"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.session.try_read() {
            Ok(session) => session.as_ref().is_some_and(AmqpSession::is_open),
            // A writer holds the lock only while (re)connecting
            Err(_) => false,
        }
    }

    async fn close(&self) -> MessagingResult<()> {
        let mut session = self.session.write().await;
        if let Some(s) = session.take() {
            if let Err(e) = s.channel.close(200, "OK").await {
                debug!(error = %e, "Channel close failed");
            }
            if let Err(e) = s.connection.close(200, "OK").await {
                warn!(error = %e, "RabbitMQ connection close failed");
            }
        }
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> MessagingResult<()> {
        self.channel()
            .await?
            .exchange_declare(
                &exchange.name,
                Self::exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::channel(format!(
                    "Exchange '{}' declaration failed: {e}",
                    exchange.name
                ))
            })
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> MessagingResult<()> {
        self.channel()
            .await?
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                Self::queue_arguments(queue),
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                MessagingError::queue_operation(
                    &queue.name,
                    "declare",
                    format!("Queue creation failed: {e}"),
                )
            })
    }

    async fn bind_queue(&self, binding: &Binding) -> MessagingResult<()> {
        self.channel()
            .await?
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::queue_operation(
                    &binding.queue,
                    "bind",
                    format!("Binding failed: {e}"),
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> MessagingResult<()> {
        let confirm = self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                Self::basic_properties(properties),
            )
            .await
            .map_err(|e| MessagingError::publish(exchange, routing_key, e.to_string()))?;

        confirm
            .await
            .map_err(|e| {
                MessagingError::publish(exchange, routing_key, format!("confirmation failed: {e}"))
            })?;
        Ok(())
    }

    async fn receive(&self, queue: &str, auto_ack: bool) -> MessagingResult<Delivery> {
        loop {
            let message = self
                .channel()
                .await?
                .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
                .await
                .map_err(|e| Self::map_lapin_error(queue, "basic_get", e))?;

            let Some(message) = message else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };

            let properties = Self::message_properties(&message.delivery.properties);
            let header_count = properties
                .headers
                .get(DELIVERY_COUNT_HEADER)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);
            let local_count = properties
                .message_id
                .as_ref()
                .and_then(|id| self.requeues.lock().get(id).copied())
                .unwrap_or(0);

            let delivery_tag = message.delivery.delivery_tag;
            if !auto_ack {
                self.in_flight
                    .lock()
                    .insert(delivery_tag, properties.message_id.clone());
            }

            return Ok(Delivery {
                delivery_tag,
                queue: queue.to_string(),
                exchange: message.delivery.exchange.as_str().to_string(),
                routing_key: message.delivery.routing_key.as_str().to_string(),
                body: message.delivery.data.clone(),
                redelivered: message.delivery.redelivered,
                retry_count: header_count.max(local_count),
                properties,
            });
        }
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        self.channel()
            .await?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Self::map_lapin_error(queue, "ack", e))?;

        if let Some(Some(message_id)) = self.in_flight.lock().remove(&delivery_tag) {
            self.requeues.lock().remove(&message_id);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.channel()
            .await?
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_lapin_error(queue, "nack", e))?;

        if let Some(Some(message_id)) = self.in_flight.lock().remove(&delivery_tag) {
            let mut requeues = self.requeues.lock();
            if requeue {
                *requeues.entry(message_id).or_insert(0) += 1;
            } else {
                requeues.remove(&message_id);
            }
        }
        Ok(())
    }

    async fn queue_info(&self, queue: &str) -> MessagingResult<Option<QueueInfo>> {
        let probe = {
            let session = self.session.read().await;
            match session.as_ref() {
                Some(s) if s.is_open() => s.connection.create_channel().await.map_err(|e| {
                    MessagingError::channel(format!("Probe channel creation failed: {e}"))
                })?,
                _ => return Err(MessagingError::connection("RabbitMQ connection is not open")),
            }
        };

        let result = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(state) => {
                if let Err(e) = probe.close(200, "OK").await {
                    debug!(error = %e, "Probe channel close failed");
                }
                Ok(Some(QueueInfo {
                    queue: queue.to_string(),
                    message_count: u64::from(state.message_count()),
                    consumer_count: state.consumer_count(),
                }))
            }
            Err(e) if e.to_string().contains("NOT_FOUND") => Ok(None),
            Err(e) => Err(MessagingError::queue_operation(queue, "inspect", e.to_string())),
        }
    }

    async fn purge_queue(&self, queue: &str) -> MessagingResult<u64> {
        self.channel()
            .await?
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map(u64::from)
            .map_err(|e| MessagingError::queue_operation(queue, "purge", e.to_string()))
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

impl From<Arc<RabbitMqBroker>> for crate::messaging::broker::BrokerProvider {
    fn from(broker: Arc<RabbitMqBroker>) -> Self {
        Self::RabbitMq(broker)
    }
}
