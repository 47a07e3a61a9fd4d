//! # Test Utilities
//!
//! Scripted capabilities, worker definitions and an in-memory bus for unit
//! and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, CapabilityError, CapabilityFactory, CapabilityResponse};
use crate::config::BusConfig;
use crate::events::{Event, Payload};
use crate::messaging::{handler_fn, BrokerProvider, InMemoryBroker, MessageBus, SubscriptionOptions};
use crate::models::{CapabilitySpec, ExecutionMode, WorkerConfig, WorkerType};

/// One recorded capability invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityCall {
    pub prompt: String,
    pub context: Payload,
}

/// Capability replaying a fixed script of results
///
/// Once the script is exhausted every call returns the fallback response.
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    script: Mutex<VecDeque<Result<CapabilityResponse, CapabilityError>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<CapabilityCall>>,
}

impl ScriptedCapability {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = Result<CapabilityResponse, CapabilityError>>,
    {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    pub fn calls(&self) -> Vec<CapabilityCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn execute(
        &self,
        prompt: &str,
        context: &Payload,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.lock().push(CapabilityCall {
            prompt: prompt.to_string(),
            context: context.clone(),
        });
        match self.script.lock().pop_front() {
            Some(result) => result,
            None => match &self.fallback {
                Some(response) => Ok(CapabilityResponse::text(response.clone())),
                None => Err(CapabilityError::execution("script exhausted")),
            },
        }
    }
}

/// Capability answering `echo: {prompt}`
#[derive(Debug, Default)]
pub struct EchoCapability {
    calls: AtomicUsize,
}

impl EchoCapability {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for EchoCapability {
    async fn execute(
        &self,
        prompt: &str,
        _context: &Payload,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CapabilityResponse::text(format!("echo: {prompt}")))
    }
}

/// Capability answering `echo: {prompt}` once `delay` has passed
#[derive(Debug)]
pub struct SlowCapability {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowCapability {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for SlowCapability {
    async fn execute(
        &self,
        prompt: &str,
        _context: &Payload,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(CapabilityResponse::text(format!("echo: {prompt}")))
    }
}

/// Capability that always fails
#[derive(Debug, Default)]
pub struct FailingCapability {
    calls: AtomicUsize,
}

impl FailingCapability {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for FailingCapability {
    async fn execute(
        &self,
        _prompt: &str,
        _context: &Payload,
    ) -> Result<CapabilityResponse, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CapabilityError::execution("capability unavailable"))
    }
}

/// Factory handing out preconfigured capabilities by worker name
#[derive(Default)]
pub struct StaticCapabilityFactory {
    by_worker: Mutex<HashMap<String, Arc<dyn Capability>>>,
    default: Option<Arc<dyn Capability>>,
    require_api_key: bool,
    created: Mutex<Vec<(String, Option<String>)>>,
}

impl StaticCapabilityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every worker without an explicit capability gets this one
    pub fn with_default(mut self, capability: Arc<dyn Capability>) -> Self {
        self.default = Some(capability);
        self
    }

    pub fn with_worker(
        self,
        worker_name: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.by_worker.lock().insert(worker_name.into(), capability);
        self
    }

    /// Fail `create` when no API key is supplied
    pub fn requiring_api_key(mut self) -> Self {
        self.require_api_key = true;
        self
    }

    /// `(worker, api_key)` for every successful `create`
    pub fn created(&self) -> Vec<(String, Option<String>)> {
        self.created.lock().clone()
    }
}

impl CapabilityFactory for StaticCapabilityFactory {
    fn create(
        &self,
        config: &WorkerConfig,
        api_key: Option<String>,
    ) -> Result<Arc<dyn Capability>, CapabilityError> {
        if self.require_api_key && api_key.is_none() {
            return Err(CapabilityError::missing_api_key(
                &config.name,
                config.capability.secret_key(),
            ));
        }
        let capability = self
            .by_worker
            .lock()
            .get(&config.name)
            .cloned()
            .or_else(|| self.default.clone())
            .ok_or_else(|| CapabilityError::unsupported_provider(&config.capability.provider))?;
        self.created.lock().push((config.name.clone(), api_key));
        Ok(capability)
    }
}

pub fn worker_config(
    name: &str,
    worker_type: WorkerType,
    execution_mode: ExecutionMode,
) -> WorkerConfig {
    WorkerConfig::new(
        name,
        worker_type,
        execution_mode,
        CapabilitySpec::new("anthropic", "claude-test"),
    )
}

pub fn autonomous_worker(name: &str) -> WorkerConfig {
    worker_config(name, WorkerType::Autonomous, ExecutionMode::OnDemand)
}

pub fn collaborative_worker(name: &str) -> WorkerConfig {
    worker_config(name, WorkerType::Collaborative, ExecutionMode::OnDemand)
}

pub fn continuous_worker(name: &str) -> WorkerConfig {
    worker_config(name, WorkerType::Continuous, ExecutionMode::Continuous)
}

pub fn event_driven_worker<I, S>(name: &str, patterns: I) -> WorkerConfig
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    worker_config(name, WorkerType::Autonomous, ExecutionMode::EventDriven)
        .with_subscriptions(patterns)
}

/// Bus settings with short reconnect and stop timeouts
pub fn test_bus_config() -> BusConfig {
    BusConfig {
        reconnect_delay_ms: 10,
        consumer_stop_timeout_ms: 500,
        ..BusConfig::default()
    }
}

/// Connected bus over a fresh in-memory broker
pub async fn connected_bus() -> (Arc<MessageBus>, Arc<InMemoryBroker>) {
    connected_bus_with(test_bus_config()).await
}

pub async fn connected_bus_with(config: BusConfig) -> (Arc<MessageBus>, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = Arc::new(MessageBus::new(config, BrokerProvider::from(Arc::clone(&broker))));
    if let Err(e) = bus.connect().await {
        panic!("in-memory bus failed to connect: {e}");
    }
    (bus, broker)
}

/// Declare a queue bound to `patterns` that nobody consumes, so tests can
/// inspect what was published with [`InMemoryBroker::queued_events`]
pub async fn probe_queue<I, S>(bus: &MessageBus, queue: &str, patterns: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let handler = handler_fn("probe", |_event: Event| async { Ok(()) });
    if let Err(e) = bus
        .subscribe(queue, patterns, Arc::new(handler), SubscriptionOptions::default().without_dlq())
        .await
    {
        panic!("probe queue {queue} could not be declared: {e}");
    }
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("condition not met within 5s");
    }
}
