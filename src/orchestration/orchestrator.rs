//! # Worker Orchestrator
//!
//! Owns the registry of workers: registration, start, invocation routing,
//! restart policy and graceful shutdown. The health loop lives in
//! [`health`](super::health) and the lifecycle listener in
//! [`lifecycle`](super::lifecycle); both operate on the same shared state.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use agentrunner_core::config::OrchestratorConfig;
//! use agentrunner_core::orchestration::WorkerOrchestrator;
//! use agentrunner_core::registry::InMemoryWorkerDirectory;
//! use agentrunner_core::state::InMemoryStateStore;
//! use agentrunner_core::test_utils::{autonomous_worker, connected_bus};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (bus, _broker) = connected_bus().await;
//! let orchestrator = WorkerOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     bus,
//!     Arc::new(InMemoryWorkerDirectory::new()),
//!     Arc::new(InMemoryStateStore::new()),
//! );
//!
//! orchestrator.register(autonomous_worker("summarizer")).await?;
//! let execution_id = orchestrator
//!     .invoke("summarizer", serde_json::json!({"prompt": "summarize"}))
//!     .await;
//! assert!(execution_id.is_some());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::errors::{OrchestrationError, OrchestrationResult};
use super::router::PoolRoute;
use super::types::{RegistryFilter, WorkerRegistration, WorkerSnapshot};
use crate::config::OrchestratorConfig;
use crate::constants::{queues, routing, services};
use crate::events::{Event, EventType, Payload};
use crate::messaging::{EventHandler, HandlerError, MessageBus, SubscriptionOptions};
use crate::models::{ExecutionMode, WorkerConfig};
use crate::registry::WorkerDirectory;
use crate::state::StateStore;
use crate::state_machine::WorkerStatus;

pub(super) struct OrchestratorInner {
    pub(super) config: OrchestratorConfig,
    pub(super) bus: Arc<MessageBus>,
    pub(super) directory: Arc<dyn WorkerDirectory>,
    pub(super) state_store: Arc<dyn StateStore>,
    pub(super) registry: RwLock<HashMap<String, WorkerRegistration>>,
    pub(super) shutdown: CancellationToken,
    pub(super) shutdown_requested: AtomicBool,
    pub(super) initialized: AtomicBool,
    pub(super) health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Central owner of worker lifecycle and routing
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct WorkerOrchestrator {
    pub(super) inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for WorkerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOrchestrator")
            .field("config", &self.inner.config)
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}

impl WorkerOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        bus: Arc<MessageBus>,
        directory: Arc<dyn WorkerDirectory>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        info!(
            health_check_interval_seconds = config.health_check_interval_seconds,
            max_restart_attempts = config.max_restart_attempts,
            shutdown_timeout_seconds = config.shutdown_timeout_seconds,
            "🎯 ORCHESTRATOR: Created"
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                bus,
                directory,
                state_store,
                registry: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                shutdown_requested: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                health_task: Mutex::new(None),
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<OrchestratorInner>) -> Self {
        Self { inner }
    }

    pub(super) fn downgrade(&self) -> Weak<OrchestratorInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Register every enabled worker, attach the lifecycle listener and start
    /// the health loop; later calls are no-ops
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> OrchestrationResult<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("Orchestrator already initialized");
            return Ok(());
        }

        let workers = match self.inner.directory.enabled_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                self.inner.initialized.store(false, Ordering::SeqCst);
                error!(error = %e, "🎯 ORCHESTRATOR: Failed to load worker definitions");
                return Err(e.into());
            }
        };
        info!(worker_count = workers.len(), "🎯 ORCHESTRATOR: Loaded enabled workers");

        for config in workers {
            let name = config.name.clone();
            if let Err(e) = self.register(config).await {
                error!(worker = %name, error = %e, "🎯 ORCHESTRATOR: Failed to register worker");
            }
        }

        self.attach_lifecycle_listener().await?;
        self.spawn_health_loop();

        info!(
            registered = self.inner.registry.read().await.len(),
            "🎯 ORCHESTRATOR: Initialized"
        );
        Ok(())
    }

    /// Add a worker and start it; returns whether the start succeeded
    #[instrument(skip(self, config), fields(worker = %config.name))]
    pub async fn register(&self, config: WorkerConfig) -> OrchestrationResult<bool> {
        if !config.enabled {
            warn!(worker = %config.name, "🎯 ORCHESTRATOR: Refusing to register disabled worker");
            return Err(OrchestrationError::worker_disabled(&config.name));
        }
        config
            .validate()
            .map_err(|e| OrchestrationError::invalid_config(&config.name, e))?;

        let name = config.name.clone();
        {
            let mut registry = self.inner.registry.write().await;
            if registry.contains_key(&name) {
                return Err(OrchestrationError::duplicate_worker(&name));
            }
            info!(
                worker = %name,
                worker_type = %config.worker_type,
                execution_mode = %config.execution_mode,
                subscriptions = ?config.event_subscriptions,
                "🎯 ORCHESTRATOR: Registered worker"
            );
            registry.insert(name.clone(), WorkerRegistration::new(config));
        }

        Ok(self.start(&name).await)
    }

    /// Remove a worker, stopping its consumer; returns whether it was known
    #[instrument(skip(self))]
    pub async fn deregister(&self, name: &str) -> bool {
        let Some(registration) = self.inner.registry.write().await.remove(name) else {
            return false;
        };

        if registration.metadata.status.is_active() {
            self.announce_stop(name).await;
        }
        if registration.config.execution_mode == ExecutionMode::EventDriven {
            self.inner.bus.unsubscribe(&queues::worker_queue(name)).await;
        }
        info!(worker = %name, "🎯 ORCHESTRATOR: Deregistered worker");
        true
    }

    /// Wire a worker into the bus according to its execution mode
    ///
    /// READY on success, FAILED with the captured error otherwise.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> bool {
        let Some(config) = self.worker_config(name).await else {
            error!(worker = %name, "🎯 ORCHESTRATOR: Cannot start unknown worker");
            return false;
        };

        info!(
            worker = %name,
            execution_mode = %config.execution_mode,
            "🎯 ORCHESTRATOR: Starting worker"
        );
        let outcome = self.start_side_effects(&config).await;

        let mut registry = self.inner.registry.write().await;
        let Some(registration) = registry.get_mut(name) else {
            warn!(worker = %name, "Worker deregistered while starting");
            return false;
        };

        match outcome {
            Ok(()) => match registration.metadata.transition(name, WorkerStatus::Ready) {
                Ok(()) => {
                    registration.metadata.error = None;
                    info!(worker = %name, "🎯 ORCHESTRATOR: Worker ready");
                    true
                }
                Err(e) => {
                    warn!(
                        worker = %name,
                        error = %e,
                        "🎯 ORCHESTRATOR: Worker cannot become ready"
                    );
                    false
                }
            },
            Err(e) => {
                error!(worker = %name, error = %e, "🎯 ORCHESTRATOR: Failed to start worker");
                if let Err(transition) =
                    registration.metadata.transition(name, WorkerStatus::Failed)
                {
                    warn!(worker = %name, error = %transition, "Could not mark worker failed");
                }
                registration.metadata.error = Some(e.to_string());
                false
            }
        }
    }

    async fn start_side_effects(&self, config: &WorkerConfig) -> OrchestrationResult<()> {
        if config.execution_mode == ExecutionMode::EventDriven {
            self.subscribe_worker(config).await?;
        }
        if config.is_continuous() {
            self.start_continuous(config).await?;
        }
        Ok(())
    }

    async fn subscribe_worker(&self, config: &WorkerConfig) -> OrchestrationResult<()> {
        if config.event_subscriptions.is_empty() {
            debug!(worker = %config.name, "Event-driven worker has no subscriptions");
            return Ok(());
        }

        let queue = queues::worker_queue(&config.name);
        let handler = Arc::new(WorkerInvocationHandler {
            orchestrator: self.downgrade(),
            worker_name: config.name.clone(),
            handler_name: format!("invoke:{}", config.name),
        });
        self.inner
            .bus
            .subscribe(
                &queue,
                config.event_subscriptions.iter().cloned(),
                handler,
                SubscriptionOptions::default(),
            )
            .await?;
        self.inner.bus.start_consuming(&queue, false).await?;

        info!(
            worker = %config.name,
            queue = %queue,
            patterns = ?config.event_subscriptions,
            "🎯 ORCHESTRATOR: Worker subscribed"
        );
        Ok(())
    }

    async fn start_continuous(&self, config: &WorkerConfig) -> OrchestrationResult<()> {
        let routing_key = routing::continuous_start(&config.name);
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!(config.name));
        payload.insert(
            "config".to_string(),
            serde_json::to_value(config)
                .map_err(|e| OrchestrationError::routing_failed(&config.name, &routing_key, e))?,
        );

        let event = Event::worker_event(EventType::WorkerStarted, &config.name, payload)
            .with_source_service(services::ORCHESTRATOR);
        self.inner
            .bus
            .try_publish(&event, Some(&routing_key))
            .await
            .map_err(|e| OrchestrationError::routing_failed(&config.name, &routing_key, e))
    }

    /// Submit work to the worker's pool; returns the execution id
    #[instrument(skip(self, input))]
    pub async fn invoke(&self, name: &str, input: Value) -> Option<Uuid> {
        self.invoke_from(name, input, None).await
    }

    pub(super) async fn invoke_from(
        &self,
        name: &str,
        input: Value,
        cause: Option<&Event>,
    ) -> Option<Uuid> {
        let config = {
            let mut registry = self.inner.registry.write().await;
            let Some(registration) = registry.get_mut(name) else {
                error!(worker = %name, "🎯 ORCHESTRATOR: Cannot invoke unknown worker");
                return None;
            };
            let status = registration.metadata.status;
            if !status.is_active() {
                warn!(worker = %name, status = %status, "🎯 ORCHESTRATOR: Worker not ready");
                return None;
            }
            if let Err(e) = registration.metadata.transition(name, WorkerStatus::Running) {
                warn!(worker = %name, error = %e, "🎯 ORCHESTRATOR: Cannot mark worker running");
                return None;
            }
            registration.config.clone()
        };

        let execution_id = Uuid::now_v7();
        let route = PoolRoute::for_worker(&config);
        let routing_key = route.routing_key(name);
        info!(
            worker = %name,
            execution_id = %execution_id,
            route = %route,
            routing_key = %routing_key,
            "🎯 ORCHESTRATOR: Invoking worker"
        );

        // The pool's terminal record must land after the placeholder
        self.record_execution(name, execution_id, "started", json!({})).await;

        if let Err(e) = self
            .route_task(&config, execution_id, input, &routing_key, cause)
            .await
        {
            error!(
                worker = %name,
                execution_id = %execution_id,
                error = %e,
                "🎯 ORCHESTRATOR: Routing failed"
            );
            self.record_execution(name, execution_id, "failed", json!({"error": e.to_string()}))
                .await;
            self.mark_idle(name).await;
            return None;
        }

        Some(execution_id)
    }

    async fn record_execution(&self, name: &str, execution_id: Uuid, status: &str, result: Value) {
        if let Err(e) = self
            .inner
            .state_store
            .save_execution_result(name, execution_id, status, result, 0.0)
            .await
        {
            warn!(
                worker = %name,
                execution_id = %execution_id,
                status = %status,
                error = %e,
                "Failed to record execution"
            );
        }
    }

    async fn route_task(
        &self,
        config: &WorkerConfig,
        execution_id: Uuid,
        input: Value,
        routing_key: &str,
        cause: Option<&Event>,
    ) -> OrchestrationResult<()> {
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!(config.name));
        payload.insert("execution_id".to_string(), json!(execution_id.to_string()));
        payload.insert("input".to_string(), input);
        payload.insert(
            "config".to_string(),
            serde_json::to_value(config)
                .map_err(|e| OrchestrationError::routing_failed(&config.name, routing_key, e))?,
        );

        let mut event = Event::worker_event(EventType::TaskSubmitted, &config.name, payload)
            .with_source_service(services::ORCHESTRATOR)
            .with_execution_id(execution_id);
        if let Some(cause) = cause {
            event = event.with_parent(cause);
        }

        self.inner
            .bus
            .try_publish(&event, Some(routing_key))
            .await
            .map_err(|e| OrchestrationError::routing_failed(&config.name, routing_key, e))
    }

    /// RUNNING back to READY; other statuses are left alone
    pub(super) async fn mark_idle(&self, name: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        match registry.get_mut(name) {
            Some(registration) if registration.metadata.status == WorkerStatus::Running => {
                registration.metadata.transition(name, WorkerStatus::Ready).is_ok()
            }
            _ => false,
        }
    }

    /// Healthy when no heartbeat was ever seen or the last one is recent
    pub async fn health_check(&self, name: &str) -> bool {
        let registry = self.inner.registry.read().await;
        let Some(registration) = registry.get(name) else {
            return false;
        };
        let Some(last_heartbeat) = registration.metadata.last_heartbeat else {
            return true;
        };

        let since = last_heartbeat.elapsed();
        let healthy = since <= self.inner.config.health_check_interval();
        if !healthy {
            warn!(
                worker = %name,
                seconds_since_heartbeat = since.as_secs_f64(),
                "🏥 HEALTH: Worker unresponsive"
            );
        }
        healthy
    }

    pub async fn record_heartbeat(&self, name: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        match registry.get_mut(name) {
            Some(registration) => {
                registration.metadata.record_heartbeat();
                true
            }
            None => false,
        }
    }

    /// Restart a worker, consuming one attempt of its restart budget
    ///
    /// Once the budget is spent the worker is pinned to FAILED and further
    /// restarts are refused.
    #[instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> bool {
        let max_attempts = self.inner.config.max_restart_attempts;
        let proceed = {
            let mut registry = self.inner.registry.write().await;
            let Some(registration) = registry.get_mut(name) else {
                return false;
            };
            let metadata = &mut registration.metadata;
            if metadata.restarts_exhausted || metadata.status.is_terminal() {
                return false;
            }

            metadata.restart_count += 1;
            if metadata.restart_count > max_attempts {
                error!(
                    worker = %name,
                    restart_count = metadata.restart_count,
                    max_restart_attempts = max_attempts,
                    "🎯 ORCHESTRATOR: Restart attempts exhausted"
                );
                if let Err(e) = metadata.transition(name, WorkerStatus::Failed) {
                    warn!(worker = %name, error = %e, "Could not mark worker failed");
                }
                metadata.restarts_exhausted = true;
                false
            } else {
                info!(
                    worker = %name,
                    attempt = metadata.restart_count,
                    max_restart_attempts = max_attempts,
                    "🎯 ORCHESTRATOR: Restarting worker"
                );
                match metadata.transition(name, WorkerStatus::Initializing) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(worker = %name, error = %e, "Cannot reinitialize worker");
                        false
                    }
                }
            }
        };

        proceed && self.start(name).await
    }

    /// Stop every active worker, waiting at most `timeout` (the configured
    /// shutdown timeout when `None`) before force-marking the rest SHUTDOWN
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        if self.inner.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already requested");
            return;
        }
        let timeout = timeout.unwrap_or_else(|| self.inner.config.shutdown_timeout());
        info!(
            timeout_ms = timeout.as_millis() as u64,
            "🛑 ORCHESTRATOR: Initiating graceful shutdown"
        );

        self.inner.shutdown.cancel();
        let health_task = self.inner.health_task.lock().take();
        if let Some(task) = health_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health loop ended abnormally");
            }
        }
        self.inner
            .bus
            .stop_consuming(Some(queues::ORCHESTRATOR_LIFECYCLE))
            .await;

        let active: Vec<String> = self
            .inner
            .registry
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.metadata.status.is_active())
            .map(|(name, _)| name.clone())
            .collect();

        let stops = active.iter().map(|name| self.stop_worker(name));
        match tokio::time::timeout(timeout, join_all(stops)).await {
            Ok(_) => info!(
                stopped = active.len(),
                "🛑 ORCHESTRATOR: All workers shut down gracefully"
            ),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "🛑 ORCHESTRATOR: Shutdown timeout exceeded, forcing termination"
                );
                let mut registry = self.inner.registry.write().await;
                for (name, registration) in registry.iter_mut() {
                    if registration.metadata.status != WorkerStatus::Shutdown {
                        if let Err(e) =
                            registration.metadata.transition(name, WorkerStatus::Shutdown)
                        {
                            warn!(worker = %name, error = %e, "Could not force shutdown");
                        }
                    }
                }
            }
        }

        info!("🛑 ORCHESTRATOR: Shutdown complete");
    }

    async fn stop_worker(&self, name: &str) {
        info!(worker = %name, "🛑 ORCHESTRATOR: Stopping worker");
        self.announce_stop(name).await;
        self.inner
            .bus
            .stop_consuming(Some(&queues::worker_queue(name)))
            .await;

        let mut registry = self.inner.registry.write().await;
        if let Some(registration) = registry.get_mut(name) {
            if let Err(e) = registration.metadata.transition(name, WorkerStatus::Shutdown) {
                warn!(worker = %name, error = %e, "Could not mark worker shut down");
            }
        }
    }

    async fn announce_stop(&self, name: &str) {
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!(name));
        payload.insert("shutdown_time".to_string(), json!(Utc::now().to_rfc3339()));
        let event = Event::worker_event(EventType::WorkerStopped, name, payload)
            .with_source_service(services::ORCHESTRATOR);
        self.inner
            .bus
            .publish(&event, Some(&routing::worker_shutdown(name)))
            .await;
    }

    pub async fn status(&self, name: &str) -> Option<WorkerStatus> {
        self.inner
            .registry
            .read()
            .await
            .get(name)
            .map(|r| r.metadata.status)
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Snapshots of registrations matching `filter`, sorted by name
    pub async fn registry_snapshot(&self, filter: RegistryFilter) -> Vec<WorkerSnapshot> {
        let registry = self.inner.registry.read().await;
        let mut snapshots: Vec<WorkerSnapshot> = registry
            .values()
            .filter(|r| filter.matches(r))
            .map(WorkerRegistration::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub async fn snapshot(&self, name: &str) -> Option<WorkerSnapshot> {
        self.inner
            .registry
            .read()
            .await
            .get(name)
            .map(WorkerRegistration::snapshot)
    }

    async fn worker_config(&self, name: &str) -> Option<WorkerConfig> {
        self.inner
            .registry
            .read()
            .await
            .get(name)
            .map(|r| r.config.clone())
    }
}

/// Consumer of an event-driven worker's queue: each event invokes the worker
/// with the event payload as input
struct WorkerInvocationHandler {
    orchestrator: Weak<OrchestratorInner>,
    worker_name: String,
    handler_name: String,
}

#[async_trait]
impl EventHandler for WorkerInvocationHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(inner) = self.orchestrator.upgrade() else {
            debug!(worker = %self.worker_name, "Orchestrator dropped, ignoring event");
            return Ok(());
        };
        let orchestrator = WorkerOrchestrator::from_inner(inner);

        let input = Value::Object(event.payload.clone());
        match orchestrator.invoke_from(&self.worker_name, input, Some(&event)).await {
            Some(_) => Ok(()),
            None => Err(HandlerError::new(format!(
                "worker {} could not be invoked",
                self.worker_name
            ))),
        }
    }

    fn name(&self) -> &str {
        &self.handler_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::InMemoryBroker;
    use crate::registry::InMemoryWorkerDirectory;
    use crate::state::{InMemoryStateStore, StateStoreResult};
    use crate::test_utils::{
        autonomous_worker, collaborative_worker, connected_bus, connected_bus_with,
        continuous_worker,
        event_driven_worker, probe_queue, test_bus_config, wait_until,
    };
    use crate::models::{ExecutionMode, WorkerType};
    use crate::config::BusConfig;

    struct Harness {
        orchestrator: WorkerOrchestrator,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStateStore>,
    }

    async fn harness() -> Harness {
        harness_with(test_bus_config(), OrchestratorConfig::default()).await
    }

    async fn harness_with(bus_config: BusConfig, config: OrchestratorConfig) -> Harness {
        let (bus, broker) = connected_bus_with(bus_config).await;
        let store = Arc::new(InMemoryStateStore::new());
        let orchestrator = WorkerOrchestrator::new(
            config,
            bus,
            Arc::new(InMemoryWorkerDirectory::new()),
            store.clone(),
        );
        Harness {
            orchestrator,
            broker,
            store,
        }
    }

    #[tokio::test]
    async fn test_register_rejects_disabled_invalid_and_duplicate() {
        let h = harness().await;

        let disabled = h.orchestrator.register(autonomous_worker("off").disabled()).await;
        assert!(matches!(disabled, Err(OrchestrationError::WorkerDisabled { .. })));

        let invalid = h.orchestrator.register(autonomous_worker("bad name")).await;
        assert!(matches!(invalid, Err(OrchestrationError::InvalidConfig { .. })));

        assert!(h.orchestrator.register(autonomous_worker("dup")).await.unwrap());
        let duplicate = h.orchestrator.register(autonomous_worker("dup")).await;
        assert!(matches!(duplicate, Err(OrchestrationError::DuplicateWorker { .. })));
        assert_eq!(h.orchestrator.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_event_driven_worker_is_subscribed_and_ready() {
        let h = harness().await;
        let config = event_driven_worker("watcher", ["task.completed.*", "plan.#"]);

        assert!(h.orchestrator.register(config).await.unwrap());
        assert_eq!(h.orchestrator.status("watcher").await, Some(WorkerStatus::Ready));

        let mut bindings = h.broker.bindings_for("agent.watcher", "agent_events");
        bindings.sort();
        assert_eq!(bindings, vec!["plan.#", "task.completed.*"]);
        assert!(h.orchestrator.bus().is_consuming("agent.watcher"));
    }

    #[tokio::test]
    async fn test_event_driven_worker_invoked_from_matching_event() {
        let h = harness().await;
        probe_queue(h.orchestrator.bus(), "probe", ["autonomous.task.submitted"]).await;
        h.orchestrator
            .register(event_driven_worker("watcher", ["news.#"]))
            .await
            .unwrap();

        let mut payload = Payload::new();
        payload.insert("headline".to_string(), json!("rates cut"));
        let trigger = Event::new(EventType::TaskSubmitted).with_payload(payload);
        assert!(h.orchestrator.bus().publish(&trigger, Some("news.finance")).await);

        let broker = h.broker.clone();
        wait_until(move || broker.queue_length("probe") == 1).await;
        let routed = h.broker.queued_events("probe").remove(0);
        assert_eq!(routed.payload_str("worker_name"), Some("watcher"));
        assert_eq!(routed.payload["input"]["headline"], "rates cut");
        assert_eq!(routed.parent_id, Some(trigger.id));
    }

    #[tokio::test]
    async fn test_continuous_worker_start_is_announced() {
        let h = harness().await;
        probe_queue(h.orchestrator.bus(), "probe", ["continuous.start.*"]).await;

        assert!(h.orchestrator.register(continuous_worker("assistant")).await.unwrap());

        let events = h.broker.queued_events("probe");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::WorkerStarted);
        assert_eq!(events[0].payload_str("worker_name"), Some("assistant"));
        assert_eq!(events[0].payload["config"]["name"], "assistant");
    }

    #[tokio::test]
    async fn test_invoke_routes_and_records_start() {
        let h = harness().await;
        probe_queue(h.orchestrator.bus(), "probe", ["#"]).await;
        h.orchestrator.register(collaborative_worker("planner")).await.unwrap();

        let execution_id = h
            .orchestrator
            .invoke("planner", json!({"description": "quarterly review"}))
            .await
            .unwrap();

        assert_eq!(execution_id.get_version_num(), 7);
        assert_eq!(h.orchestrator.status("planner").await, Some(WorkerStatus::Running));

        let events = h.broker.queued_events("probe");
        let submitted = events
            .iter()
            .find(|e| e.event_type == EventType::TaskSubmitted)
            .unwrap();
        assert_eq!(submitted.execution_id, Some(execution_id));
        assert_eq!(submitted.payload_str("execution_id"), Some(execution_id.to_string().as_str()));
        assert_eq!(submitted.payload["input"]["description"], "quarterly review");
        assert_eq!(submitted.payload["config"]["worker_type"], "collaborative");

        let record = h.store.latest_execution(execution_id).unwrap();
        assert_eq!(record.status, "started");
        assert_eq!(record.worker_name, "planner");
    }

    #[tokio::test]
    async fn test_invoke_requires_active_worker() {
        let h = harness().await;
        assert!(h.orchestrator.invoke("ghost", json!({})).await.is_none());

        h.orchestrator.register(autonomous_worker("worker")).await.unwrap();
        h.orchestrator.shutdown(Some(Duration::from_secs(1))).await;
        assert!(h.orchestrator.invoke("worker", json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_invoke_resets_to_ready_when_routing_fails() {
        let h = harness().await;
        h.orchestrator.register(autonomous_worker("worker")).await.unwrap();

        h.broker.set_refuse_connections(true);
        h.broker.simulate_connection_loss();

        assert!(h.orchestrator.invoke("worker", json!({})).await.is_none());
        assert_eq!(h.orchestrator.status("worker").await, Some(WorkerStatus::Ready));

        let statuses: Vec<String> = h
            .store
            .records_for_worker("worker")
            .into_iter()
            .map(|record| record.status)
            .collect();
        assert_eq!(statuses, vec!["started", "failed"]);
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed_with_error() {
        let h = harness().await;
        h.broker.set_refuse_connections(true);
        h.broker.simulate_connection_loss();

        let started = h
            .orchestrator
            .register(event_driven_worker("watcher", ["task.#"]))
            .await
            .unwrap();

        assert!(!started);
        let snapshot = h.orchestrator.snapshot("watcher").await.unwrap();
        assert_eq!(snapshot.status, WorkerStatus::Failed);
        assert!(snapshot.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_uses_heartbeat_age() {
        let h = harness().await;
        h.orchestrator.register(autonomous_worker("worker")).await.unwrap();

        assert!(!h.orchestrator.health_check("ghost").await);
        assert!(h.orchestrator.health_check("worker").await);

        assert!(h.orchestrator.record_heartbeat("worker").await);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(h.orchestrator.health_check("worker").await);

        tokio::time::advance(Duration::from_secs(1) + Duration::from_millis(1)).await;
        assert!(!h.orchestrator.health_check("worker").await);
    }

    #[tokio::test]
    async fn test_restart_budget_pins_failed() {
        let h = harness().await;
        h.orchestrator.register(autonomous_worker("flaky")).await.unwrap();

        for _ in 0..3 {
            assert!(h.orchestrator.restart("flaky").await);
            assert_eq!(h.orchestrator.status("flaky").await, Some(WorkerStatus::Ready));
        }
        assert!(!h.orchestrator.restart("flaky").await);
        assert_eq!(h.orchestrator.status("flaky").await, Some(WorkerStatus::Failed));

        assert!(!h.orchestrator.restart("flaky").await);
        let snapshot = h.orchestrator.snapshot("flaky").await.unwrap();
        assert_eq!(snapshot.restart_count, 4);
        assert_eq!(snapshot.status, WorkerStatus::Failed);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_stops_active_workers() {
        let h = harness().await;
        probe_queue(h.orchestrator.bus(), "probe", ["agent.shutdown.*"]).await;
        h.orchestrator.register(autonomous_worker("a")).await.unwrap();
        h.orchestrator
            .register(event_driven_worker("b", ["task.#"]))
            .await
            .unwrap();

        h.orchestrator.shutdown(Some(Duration::from_secs(5))).await;

        for name in ["a", "b"] {
            assert_eq!(h.orchestrator.status(name).await, Some(WorkerStatus::Shutdown));
        }
        assert!(!h.orchestrator.bus().is_consuming("agent.b"));

        let stopped: Vec<String> = h
            .broker
            .queued_events("probe")
            .into_iter()
            .filter(|e| e.event_type == EventType::WorkerStopped)
            .filter_map(|e| e.source_worker)
            .collect();
        assert_eq!(stopped.len(), 2);
        assert!(h.orchestrator.is_shutdown_requested());
    }

    /// Store whose execution writes never complete
    struct StallingStore;

    #[async_trait]
    impl StateStore for StallingStore {
        async fn save_state(&self, _worker: &str, _state: Payload) -> StateStoreResult<()> {
            Ok(())
        }

        async fn load_latest_state(&self, _worker: &str) -> StateStoreResult<Option<Payload>> {
            Ok(None)
        }

        async fn save_execution_result(
            &self,
            _worker: &str,
            _execution_id: Uuid,
            _status: &str,
            _result: Value,
            _duration_seconds: f64,
        ) -> StateStoreResult<()> {
            std::future::pending().await
        }

        async fn update_plan_state(&self, _plan_id: Uuid, _state: Payload) -> StateStoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_timeout_force_marks_workers() {
        let bus_config = BusConfig {
            consumer_stop_timeout_ms: 10_000,
            ..test_bus_config()
        };
        let (bus, _broker) = connected_bus_with(bus_config).await;
        let orchestrator = WorkerOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::clone(&bus),
            Arc::new(InMemoryWorkerDirectory::new()),
            Arc::new(StallingStore),
        );
        orchestrator
            .register(event_driven_worker("stuck", ["jobs.#"]))
            .await
            .unwrap();
        orchestrator.register(autonomous_worker("idle")).await.unwrap();

        // The consumer is now parked inside the stalled execution write
        assert!(bus.publish(&Event::new(EventType::TaskSubmitted), Some("jobs.new")).await);
        let probe = orchestrator.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while probe.status("stuck").await != Some(WorkerStatus::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        orchestrator.shutdown(Some(Duration::from_millis(100))).await;

        assert_eq!(orchestrator.status("stuck").await, Some(WorkerStatus::Shutdown));
        assert_eq!(orchestrator.status("idle").await, Some(WorkerStatus::Shutdown));
    }

    #[tokio::test]
    async fn test_registry_snapshot_filters() {
        let h = harness().await;
        h.orchestrator.register(autonomous_worker("b-auto")).await.unwrap();
        h.orchestrator.register(autonomous_worker("a-auto")).await.unwrap();
        h.orchestrator.register(collaborative_worker("planner")).await.unwrap();
        h.orchestrator.invoke("planner", json!({})).await.unwrap();

        let autonomous = h
            .orchestrator
            .registry_snapshot(RegistryFilter::all().with_worker_type(WorkerType::Autonomous))
            .await;
        let names: Vec<&str> = autonomous.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a-auto", "b-auto"]);

        let running = h
            .orchestrator
            .registry_snapshot(RegistryFilter::all().with_status(WorkerStatus::Running))
            .await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "planner");

        let scheduled = h
            .orchestrator
            .registry_snapshot(RegistryFilter::all().with_execution_mode(ExecutionMode::Scheduled))
            .await;
        assert!(scheduled.is_empty());
    }

    #[tokio::test]
    async fn test_deregister_unsubscribes_worker() {
        let (bus, _broker) = connected_bus().await;
        let orchestrator = WorkerOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::clone(&bus),
            Arc::new(InMemoryWorkerDirectory::new()),
            Arc::new(InMemoryStateStore::new()),
        );
        orchestrator
            .register(event_driven_worker("watcher", ["task.#"]))
            .await
            .unwrap();

        assert!(orchestrator.deregister("watcher").await);
        assert!(!orchestrator.deregister("watcher").await);
        assert!(!bus.is_consuming("agent.watcher"));
        assert!(bus.subscription_patterns("agent.watcher").is_none());
    }
}
