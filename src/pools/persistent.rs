//! # Persistent Runner
//!
//! Hosts long-lived continuous workers. Each worker owns a dedicated input
//! queue `agent.input.{name}` with a single consumer, so its events are
//! processed strictly one at a time against its conversation state.
//!
//! State survives restarts through the [`StateStore`]: it is loaded on start,
//! checkpointed every `save_interval`, flushed when a worker goes idle and
//! saved once more on stop.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::errors::{PoolError, PoolResult};
use crate::capability::{Capability, CapabilityFactory, CapabilityResponse};
use crate::config::PersistentRunnerConfig;
use crate::constants::{patterns, queues, routing, services};
use crate::events::{Event, EventType, Payload};
use crate::messaging::{EventHandler, HandlerError, MessageBus, SubscriptionOptions};
use crate::models::{ContinuousState, WorkerConfig};
use crate::registry::WorkerDirectory;
use crate::state::StateStore;

/// One hosted worker
struct RunnerWorker {
    config: WorkerConfig,
    queue: String,
    capability: Arc<dyn Capability>,
    state: AsyncMutex<ContinuousState>,
    /// Mirror of `state.event_count`, readable while an event holds `state`
    event_count: AtomicU64,
    running: AtomicBool,
    /// Changed since the last successful save
    dirty: AtomicBool,
    /// Already flushed during the current idle stretch
    flushed: AtomicBool,
    last_activity: Mutex<Instant>,
    last_saved: Mutex<Instant>,
}

impl RunnerWorker {
    fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    fn since_save(&self) -> std::time::Duration {
        self.last_saved.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.flushed.store(false, Ordering::SeqCst);
    }
}

/// What one maintenance sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub flushed: Vec<String>,
    pub checkpointed: Vec<String>,
}

pub struct PersistentRunner {
    config: PersistentRunnerConfig,
    bus: Arc<MessageBus>,
    directory: Arc<dyn WorkerDirectory>,
    state_store: Arc<dyn StateStore>,
    factory: Arc<dyn CapabilityFactory>,
    workers: RwLock<HashMap<String, Arc<RunnerWorker>>>,
    shutdown: CancellationToken,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for PersistentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRunner")
            .field("config", &self.config)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

impl PersistentRunner {
    pub fn new(
        config: PersistentRunnerConfig,
        bus: Arc<MessageBus>,
        directory: Arc<dyn WorkerDirectory>,
        state_store: Arc<dyn StateStore>,
        factory: Arc<dyn CapabilityFactory>,
    ) -> Self {
        Self {
            config,
            bus,
            directory,
            state_store,
            factory,
            workers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            maintenance_task: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Start every continuous worker in the directory, attach the control
    /// queue and spawn the maintenance loop; runs once
    pub async fn initialize(self: &Arc<Self>) -> PoolResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.directory.enabled_workers().await {
            Ok(workers) => {
                for config in workers.into_iter().filter(WorkerConfig::is_continuous) {
                    let name = config.name.clone();
                    if let Err(e) = self.start_worker(config).await {
                        error!(worker = %name, error = %e, "🔁 RUNNER: Failed to start worker");
                    }
                }
            }
            Err(e) => warn!(
                error = %e,
                "🔁 RUNNER: Worker directory unavailable, waiting for start events"
            ),
        }

        let control = Arc::new(ControlHandler {
            runner: Arc::downgrade(self),
        });
        self.bus
            .subscribe(
                queues::PERSISTENT_RUNNER_CONTROL,
                [patterns::CONTINUOUS_START, patterns::WORKER_SHUTDOWN],
                control,
                SubscriptionOptions::default(),
            )
            .await?;
        self.bus
            .start_consuming(queues::PERSISTENT_RUNNER_CONTROL, false)
            .await?;

        self.spawn_maintenance_loop();

        info!(workers = ?self.running_workers().await, "🔁 RUNNER: Initialized");
        Ok(())
    }

    /// Restore (or create) the worker's state and start consuming its queue
    #[instrument(skip(self, config), fields(worker = %config.name))]
    pub async fn start_worker(self: &Arc<Self>, config: WorkerConfig) -> PoolResult<()> {
        if self.is_running(&config.name).await {
            debug!(worker = %config.name, "Worker already running");
            return Ok(());
        }

        let state = self.load_state(&config.name).await;
        let api_key = self.directory.get_secret(&config.capability.secret_key()).await;
        let capability = self.factory.create(&config, api_key)?;

        let name = config.name.clone();
        let queue = queues::worker_input_queue(&name);
        let history_len = state.conversation_history.len();
        let worker = Arc::new(RunnerWorker {
            config,
            queue: queue.clone(),
            capability,
            event_count: AtomicU64::new(state.event_count),
            state: AsyncMutex::new(state),
            running: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            last_saved: Mutex::new(Instant::now()),
        });
        self.workers.write().await.insert(name.clone(), worker);

        let handler = Arc::new(WorkerInputHandler {
            runner: Arc::downgrade(self),
            worker_name: name.clone(),
        });
        let subscribed = self
            .bus
            .subscribe(
                &queue,
                [routing::continuous_task(&name), routing::worker_input(&name)],
                handler,
                SubscriptionOptions::default(),
            )
            .await;
        let consuming = match subscribed {
            Ok(()) => self.bus.start_consuming(&queue, false).await,
            Err(e) => Err(e),
        };
        if let Err(e) = consuming {
            self.workers.write().await.remove(&name);
            return Err(e.into());
        }

        info!(
            worker = %name,
            queue = %queue,
            history_len = history_len,
            "🔁 RUNNER: Worker started"
        );
        Ok(())
    }

    /// Latest stored state, or a fresh one when none exists or it cannot be
    /// read
    async fn load_state(&self, worker_name: &str) -> ContinuousState {
        match self.state_store.load_latest_state(worker_name).await {
            Ok(Some(payload)) => match ContinuousState::from_payload(payload) {
                Ok(state) => {
                    info!(
                        worker = %worker_name,
                        history_len = state.conversation_history.len(),
                        event_count = state.event_count,
                        "🔁 RUNNER: Restored worker state"
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        worker = %worker_name,
                        error = %e,
                        "🔁 RUNNER: Stored state unreadable, starting fresh"
                    );
                    ContinuousState::new(worker_name)
                }
            },
            Ok(None) => ContinuousState::new(worker_name),
            Err(e) => {
                warn!(
                    worker = %worker_name,
                    error = %e,
                    "🔁 RUNNER: Could not load state, starting fresh"
                );
                ContinuousState::new(worker_name)
            }
        }
    }

    /// Run one event through the worker against its conversation state
    #[instrument(skip(self, event_data))]
    pub async fn process_event(
        &self,
        worker_name: &str,
        event_data: Payload,
    ) -> PoolResult<CapabilityResponse> {
        let worker = self
            .worker(worker_name)
            .await
            .filter(|w| w.running.load(Ordering::SeqCst))
            .ok_or_else(|| PoolError::worker_not_running(worker_name))?;
        worker.touch();

        let prompt = event_data
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut state = worker.state.lock().await;
        state.append_user(&prompt, Some(Value::Object(event_data)));
        worker.dirty.store(true, Ordering::SeqCst);

        let mut context = Payload::new();
        context.insert(
            "conversation_history".to_string(),
            json!(state.recent_history(self.config.context_window)),
        );
        context.insert("memory".to_string(), Value::Object(state.memory.clone()));
        context.insert("event_count".to_string(), json!(state.event_count));

        let response = match worker.capability.execute(&prompt, &context).await {
            Ok(response) => response,
            Err(e) => {
                drop(state);
                self.publish_output(&worker, EventType::TaskFailed, json!(e.to_string()), None)
                    .await;
                return Err(e.into());
            }
        };

        state.append_assistant(&response.response);
        state.event_count += 1;
        state.last_event_time = chrono::Utc::now();
        if let Some(updates) = response.memory_updates.clone() {
            state.merge_memory(updates);
        }
        let event_count = state.event_count;
        worker.event_count.store(event_count, Ordering::SeqCst);

        if worker.since_save() >= self.config.save_interval() {
            self.save_locked(&worker, &mut state).await;
        }
        drop(state);

        self.publish_output(
            &worker,
            EventType::TaskCompleted,
            json!(response.response),
            Some(event_count),
        )
        .await;

        debug!(worker = %worker_name, event_count = event_count, "Event processed");
        Ok(response)
    }

    async fn publish_output(
        &self,
        worker: &RunnerWorker,
        event_type: EventType,
        detail: Value,
        event_count: Option<u64>,
    ) {
        let name = &worker.config.name;
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!(name));
        match event_type {
            EventType::TaskFailed => payload.insert("error".to_string(), detail),
            _ => payload.insert("result".to_string(), detail),
        };
        if let Some(event_count) = event_count {
            payload.insert("event_count".to_string(), json!(event_count));
        }

        let event = Event::worker_event(event_type, name, payload)
            .with_source_service(services::PERSISTENT_RUNNER);
        let routing_key = routing::worker_output(name);
        if !self.bus.publish(&event, Some(&routing_key)).await {
            warn!(
                worker = %name,
                routing_key = %routing_key,
                "🔁 RUNNER: Failed to publish worker output"
            );
        }
    }

    /// Persist the worker's state; `false` (logged) when the store refused
    async fn save_worker_state(&self, worker: &RunnerWorker) -> bool {
        let mut state = worker.state.lock().await;
        self.save_locked(worker, &mut state).await
    }

    async fn save_locked(&self, worker: &RunnerWorker, state: &mut ContinuousState) -> bool {
        let name = &worker.config.name;
        let previous = state.last_saved_at.replace(chrono::Utc::now());
        let payload = match state.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                state.last_saved_at = previous;
                error!(worker = %name, error = %e, "🔁 RUNNER: Could not serialize state");
                return false;
            }
        };

        match self.state_store.save_state(name, payload).await {
            Ok(()) => {
                *worker.last_saved.lock() = Instant::now();
                worker.dirty.store(false, Ordering::SeqCst);
                debug!(
                    worker = %name,
                    history_len = state.conversation_history.len(),
                    event_count = state.event_count,
                    "State saved"
                );
                true
            }
            Err(e) => {
                state.last_saved_at = previous;
                error!(worker = %name, error = %e, "🔁 RUNNER: Failed to save state");
                false
            }
        }
    }

    /// Persist and trim an idle worker's history; it keeps consuming
    async fn flush_idle_worker(&self, worker: &RunnerWorker) {
        let mut state = worker.state.lock().await;
        self.save_locked(worker, &mut state).await;
        let trimmed = state.trim_history(self.config.history_retention);
        worker.flushed.store(true, Ordering::SeqCst);

        info!(
            worker = %worker.config.name,
            idle_seconds = worker.idle_for().as_secs(),
            trimmed = trimmed,
            "🔁 RUNNER: Flushed idle worker"
        );
    }

    fn spawn_maintenance_loop(self: &Arc<Self>) {
        let runner = Arc::downgrade(self);
        let token = self.shutdown.child_token();
        let idle_check = self.config.idle_check_interval();
        let heartbeat = self.config.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(idle_check);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pulse = tokio::time::interval(heartbeat);
            pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first ticks complete immediately
            sweep.tick().await;
            pulse.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = sweep.tick() => {
                        let Some(runner) = runner.upgrade() else { break };
                        let report = runner.maintenance_tick().await;
                        debug!(report = ?report, "Maintenance sweep complete");
                    }
                    _ = pulse.tick() => {
                        let Some(runner) = runner.upgrade() else { break };
                        runner.publish_heartbeats().await;
                    }
                }
            }
            debug!("Maintenance loop stopped");
        });

        *self.maintenance_task.lock() = Some(handle);
    }

    /// Flush workers idle past `idle_timeout` and checkpoint dirty states
    /// older than `save_interval`
    pub async fn maintenance_tick(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        for worker in self.running_snapshot().await {
            let name = worker.config.name.clone();
            if worker.idle_for() >= self.config.idle_timeout() {
                if !worker.flushed.load(Ordering::SeqCst) {
                    self.flush_idle_worker(&worker).await;
                    report.flushed.push(name);
                }
            } else if worker.dirty.load(Ordering::SeqCst)
                && worker.since_save() >= self.config.save_interval()
                && self.save_worker_state(&worker).await
            {
                report.checkpointed.push(name);
            }
        }
        report
    }

    /// Publish `agent.heartbeat` for every running worker
    pub async fn publish_heartbeats(&self) -> usize {
        let mut sent = 0;
        for worker in self.running_snapshot().await {
            let name = &worker.config.name;
            let event_count = worker.event_count.load(Ordering::SeqCst);
            let mut payload = Payload::new();
            payload.insert("worker_name".to_string(), json!(name));
            payload.insert("event_count".to_string(), json!(event_count));
            payload.insert("idle_seconds".to_string(), json!(worker.idle_for().as_secs()));

            let event = Event::worker_event(EventType::WorkerHeartbeat, name, payload)
                .with_source_service(services::PERSISTENT_RUNNER);
            if self.bus.publish(&event, Some(&routing::worker_heartbeat(name))).await {
                sent += 1;
            }
        }
        sent
    }

    /// Stop one worker: stop its consumer, save its state and forget it
    pub async fn stop_worker(&self, worker_name: &str) -> bool {
        let Some(worker) = self.workers.write().await.remove(worker_name) else {
            return false;
        };
        worker.running.store(false, Ordering::SeqCst);
        self.bus.unsubscribe(&worker.queue).await;
        self.save_worker_state(&worker).await;

        info!(worker = %worker_name, "🔁 RUNNER: Worker stopped");
        true
    }

    /// Stop the maintenance loop and every worker; store failures are logged
    /// and never stop the remaining workers from shutting down
    pub async fn stop(&self) {
        info!("🛑 RUNNER: Stopping all workers");
        self.shutdown.cancel();
        let maintenance = self.maintenance_task.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        self.bus.stop_consuming(Some(queues::PERSISTENT_RUNNER_CONTROL)).await;

        let mut workers: Vec<(String, Arc<RunnerWorker>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(name, worker)| (name.clone(), Arc::clone(worker)))
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, worker) in workers {
            self.bus.stop_consuming(Some(&worker.queue)).await;
            if !self.save_worker_state(&worker).await {
                warn!(worker = %name, "🛑 RUNNER: Final state not saved");
            }
            worker.running.store(false, Ordering::SeqCst);
        }
        info!("🛑 RUNNER: All workers stopped");
    }

    pub async fn is_running(&self, worker_name: &str) -> bool {
        self.worker(worker_name)
            .await
            .is_some_and(|w| w.running.load(Ordering::SeqCst))
    }

    pub async fn running_workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .running_snapshot()
            .await
            .iter()
            .map(|w| w.config.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Copy of the worker's conversation state
    pub async fn worker_state(&self, worker_name: &str) -> Option<ContinuousState> {
        let worker = self.worker(worker_name).await?;
        let state = worker.state.lock().await;
        Some(state.clone())
    }

    async fn worker(&self, worker_name: &str) -> Option<Arc<RunnerWorker>> {
        self.workers.read().await.get(worker_name).cloned()
    }

    async fn running_snapshot(&self) -> Vec<Arc<RunnerWorker>> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.running.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

struct WorkerInputHandler {
    runner: Weak<PersistentRunner>,
    worker_name: String,
}

#[async_trait]
impl EventHandler for WorkerInputHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(runner) = self.runner.upgrade() else {
            return Ok(());
        };

        // Orchestrator submissions carry the caller's data under `input`
        let event_data = match event.payload.get("input") {
            Some(Value::Object(input)) => input.clone(),
            _ => event.payload.clone(),
        };

        // Redelivery would append the same input twice, so failures are
        // reported on the output topic and acknowledged.
        if let Err(e) = runner.process_event(&self.worker_name, event_data).await {
            error!(
                worker = %self.worker_name,
                event_id = %event.id,
                error = %e,
                "🔁 RUNNER: Event processing failed"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.worker_name
    }
}

struct ControlHandler {
    runner: Weak<PersistentRunner>,
}

impl ControlHandler {
    async fn config_for(
        runner: &PersistentRunner,
        worker_name: &str,
        event: &Event,
    ) -> Option<WorkerConfig> {
        if let Some(value) = event.payload.get("config") {
            match serde_json::from_value::<WorkerConfig>(value.clone()) {
                Ok(config) => return Some(config),
                Err(e) => warn!(
                    worker = %worker_name,
                    error = %e,
                    "🔁 RUNNER: Start event carries unreadable config"
                ),
            }
        }
        runner.directory.worker(worker_name).await.ok().flatten()
    }
}

#[async_trait]
impl EventHandler for ControlHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(runner) = self.runner.upgrade() else {
            return Ok(());
        };
        let Some(worker_name) = event
            .source_worker
            .as_deref()
            .or_else(|| event.payload_str("worker_name"))
        else {
            warn!(event_id = %event.id, "🔁 RUNNER: Control event without worker");
            return Ok(());
        };

        match event.event_type {
            EventType::WorkerStarted => {
                let Some(config) = Self::config_for(&runner, worker_name, &event).await else {
                    warn!(worker = %worker_name, "🔁 RUNNER: No definition for started worker");
                    return Ok(());
                };
                if !config.is_continuous() {
                    debug!(worker = %worker_name, "Ignoring start for non-continuous worker");
                    return Ok(());
                }
                if let Err(e) = runner.start_worker(config).await {
                    error!(
                        worker = %worker_name,
                        error = %e,
                        "🔁 RUNNER: Failed to start worker"
                    );
                }
            }
            EventType::WorkerStopped => {
                runner.stop_worker(worker_name).await;
            }
            other => debug!(worker = %worker_name, event_type = %other, "Ignoring control event"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "persistent_runner_control"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use crate::messaging::InMemoryBroker;
    use crate::registry::InMemoryWorkerDirectory;
    use crate::state::InMemoryStateStore;
    use crate::test_utils::{
        connected_bus, continuous_worker, probe_queue, wait_until, EchoCapability,
        ScriptedCapability, SlowCapability, StaticCapabilityFactory,
    };
    use std::time::Duration;

    struct Harness {
        runner: Arc<PersistentRunner>,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStateStore>,
        directory: InMemoryWorkerDirectory,
    }

    async fn harness(factory: StaticCapabilityFactory) -> Harness {
        harness_with(factory, Arc::new(InMemoryStateStore::new())).await
    }

    async fn harness_with(
        factory: StaticCapabilityFactory,
        store: Arc<InMemoryStateStore>,
    ) -> Harness {
        let (bus, broker) = connected_bus().await;
        probe_queue(&bus, "probe.output", ["agent.output.#", "agent.heartbeat.#"]).await;
        let directory = InMemoryWorkerDirectory::new();
        let runner = Arc::new(PersistentRunner::new(
            PersistentRunnerConfig::default(),
            bus,
            Arc::new(directory.clone()),
            store.clone(),
            Arc::new(factory),
        ));
        Harness {
            runner,
            broker,
            store,
            directory,
        }
    }

    fn prompt(text: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("prompt".to_string(), json!(text));
        payload
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_state_and_checkpoints() {
        let scripted = Arc::new(
            ScriptedCapability::new([Ok(CapabilityResponse::text("hello!").with_memory_updates({
                let mut memory = Payload::new();
                memory.insert("name".to_string(), json!("Ada"));
                memory
            }))])
            .with_fallback("noted"),
        );
        let h = harness(StaticCapabilityFactory::new().with_default(scripted.clone())).await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();

        for i in 0..6 {
            h.runner
                .process_event("assistant", prompt(&format!("message {i}")))
                .await
                .unwrap();
        }

        let state = h.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.event_count, 6);
        assert_eq!(state.conversation_history.len(), 12);
        assert_eq!(state.memory["name"], "Ada");
        assert_eq!(h.store.save_count("assistant"), 0);

        let calls = scripted.calls();
        assert_eq!(calls[5].context["event_count"], 5);
        assert_eq!(calls[5].context["memory"]["name"], "Ada");
        let window = calls[5].context["conversation_history"].as_array().unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[9]["content"], "message 5");
        assert_eq!(window[9]["role"], "user");

        tokio::time::advance(Duration::from_secs(301)).await;
        h.runner.process_event("assistant", prompt("later")).await.unwrap();
        assert_eq!(h.store.save_count("assistant"), 1);
        assert_eq!(h.store.latest_state("assistant").unwrap()["event_count"], 7);

        let outputs = h.broker.queued_events("probe.output");
        assert_eq!(outputs.len(), 7);
        assert!(outputs.iter().all(|e| e.event_type == EventType::TaskCompleted));
        assert_eq!(outputs[6].source_worker.as_deref(), Some("assistant"));
        assert_eq!(outputs[6].payload["event_count"], 7);
    }

    #[tokio::test]
    async fn test_restart_restores_saved_state() {
        let store = Arc::new(InMemoryStateStore::new());
        let h = harness_with(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
            store.clone(),
        )
        .await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        h.runner.process_event("assistant", prompt("remember me")).await.unwrap();
        h.runner.stop().await;
        assert_eq!(store.save_count("assistant"), 1);

        let recovered = harness_with(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
            store.clone(),
        )
        .await;
        recovered.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        let state = recovered.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.event_count, 1);
        assert_eq!(state.conversation_history.len(), 2);
        assert_eq!(state.conversation_history[1].content, "echo: remember me");
    }

    #[tokio::test]
    async fn test_unreadable_store_starts_fresh() {
        let h = harness(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
        )
        .await;
        h.store.set_fail_reads(true);
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        let state = h.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.event_count, 0);
        assert!(state.conversation_history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_is_flushed_once_and_keeps_consuming() {
        let h = harness(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
        )
        .await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        for i in 0..60 {
            h.runner.process_event("assistant", prompt(&format!("m{i}"))).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = h.runner.maintenance_tick().await;
        assert_eq!(report.flushed, vec!["assistant"]);
        assert_eq!(h.store.save_count("assistant"), 1);
        let state = h.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.conversation_history.len(), 100);
        assert_eq!(state.conversation_history[0].content, "m10");

        let report = h.runner.maintenance_tick().await;
        assert!(report.flushed.is_empty());
        assert_eq!(h.store.save_count("assistant"), 1);

        assert!(h.runner.is_running("assistant").await);
        assert!(h
            .runner
            .bus
            .subscribed_queues()
            .contains(&"agent.input.assistant".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dirty_state_is_checkpointed() {
        let h = harness(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
        )
        .await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        h.runner.start_worker(continuous_worker("quiet")).await.unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        h.runner.process_event("assistant", prompt("hi")).await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;

        let report = h.runner.maintenance_tick().await;
        assert_eq!(report.checkpointed, vec!["assistant"]);
        assert_eq!(h.store.save_count("quiet"), 0);
    }

    #[tokio::test]
    async fn test_stop_tolerates_store_failures() {
        let h = harness(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
        )
        .await;
        h.runner.start_worker(continuous_worker("alpha")).await.unwrap();
        h.runner.start_worker(continuous_worker("beta")).await.unwrap();
        h.store.set_fail_writes(true);

        h.runner.stop().await;
        assert!(!h.runner.is_running("alpha").await);
        assert!(!h.runner.is_running("beta").await);
        assert!(!h.runner.bus.is_consuming("agent.input.alpha"));
        assert!(matches!(
            h.runner.process_event("alpha", prompt("late")).await,
            Err(PoolError::WorkerNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_capability_failure_is_reported_on_output() {
        let scripted =
            Arc::new(ScriptedCapability::new([Err(CapabilityError::execution("timeout"))]));
        let h = harness(StaticCapabilityFactory::new().with_default(scripted)).await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();

        let err = h.runner.process_event("assistant", prompt("hi")).await.unwrap_err();
        assert!(matches!(err, PoolError::Capability(_)));

        let outputs = h.broker.queued_events("probe.output");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].event_type, EventType::TaskFailed);
        let state = h.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.event_count, 0);
        assert_eq!(state.conversation_history.len(), 1);
    }

    #[tokio::test]
    async fn test_control_events_start_and_stop_workers() {
        let echo = Arc::new(EchoCapability::default());
        let h = harness(StaticCapabilityFactory::new().with_default(echo.clone())).await;
        h.directory.upsert(continuous_worker("boot")).await;
        h.runner.initialize().await.unwrap();
        assert_eq!(h.runner.running_workers().await, vec!["boot"]);

        let mut payload = Payload::new();
        payload.insert(
            "config".to_string(),
            serde_json::to_value(continuous_worker("late")).unwrap(),
        );
        let start = Event::worker_event(EventType::WorkerStarted, "late", payload);
        assert!(h.runner.bus.publish(&start, Some(&routing::continuous_start("late"))).await);

        let runner = Arc::clone(&h.runner);
        wait_until(move || runner.bus.is_consuming("agent.input.late")).await;

        let mut payload = Payload::new();
        payload.insert("input".to_string(), json!({"prompt": "ping"}));
        let task = Event::worker_event(EventType::TaskSubmitted, "late", payload);
        assert!(h.runner.bus.publish(&task, Some(&routing::continuous_task("late"))).await);

        let broker = h.broker.clone();
        wait_until(move || broker.queue_length("probe.output") == 1).await;
        assert_eq!(h.broker.queued_events("probe.output")[0].payload["result"], "echo: ping");

        let stop = Event::worker_event(EventType::WorkerStopped, "late", Payload::new());
        assert!(h.runner.bus.publish(&stop, Some(&routing::worker_shutdown("late"))).await);
        let store = h.store.clone();
        wait_until(move || store.save_count("late") == 1).await;
        assert!(!h.runner.is_running("late").await);
        assert!(h.runner.is_running("boot").await);

        h.runner.stop().await;
    }

    #[tokio::test]
    async fn test_redelivered_input_is_processed_again() {
        let echo = Arc::new(EchoCapability::default());
        let h = harness(StaticCapabilityFactory::new().with_default(echo.clone())).await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();

        let event = Event::worker_event(EventType::TaskSubmitted, "assistant", prompt("status?"));
        for _ in 0..2 {
            assert!(h
                .runner
                .bus
                .publish(&event, Some(&routing::worker_input("assistant")))
                .await);
        }

        let broker = h.broker.clone();
        wait_until(move || broker.queue_length("probe.output") == 2).await;
        let state = h.runner.worker_state("assistant").await.unwrap();
        assert_eq!(state.event_count, 2);
        assert_eq!(state.conversation_history.len(), 4);
        assert_eq!(state.conversation_history[2].content, "status?");
        assert_eq!(echo.call_count(), 2);

        h.runner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_do_not_wait_for_running_event() {
        let slow = Arc::new(SlowCapability::new(Duration::from_secs(30)));
        let h = harness(StaticCapabilityFactory::new().with_default(slow.clone())).await;
        h.runner.start_worker(continuous_worker("assistant")).await.unwrap();
        h.runner.process_event("assistant", prompt("first")).await.unwrap();

        let runner = Arc::clone(&h.runner);
        let in_flight =
            tokio::spawn(async move { runner.process_event("assistant", prompt("second")).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(slow.call_count(), 2);

        let sent = tokio::time::timeout(Duration::from_millis(10), h.runner.publish_heartbeats())
            .await
            .expect("heartbeats published while the event runs");
        assert_eq!(sent, 1);
        in_flight.await.unwrap().unwrap();
        assert_eq!(h.runner.publish_heartbeats().await, 1);

        let counts: Vec<Value> = h
            .broker
            .queued_events("probe.output")
            .into_iter()
            .filter(|e| e.event_type == EventType::WorkerHeartbeat)
            .map(|e| e.payload["event_count"].clone())
            .collect();
        assert_eq!(counts, vec![json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_loop_publishes_heartbeats() {
        let h = harness(
            StaticCapabilityFactory::new().with_default(Arc::new(EchoCapability::default())),
        )
        .await;
        h.directory.upsert(continuous_worker("pulse")).await;
        h.runner.initialize().await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let heartbeats: Vec<Event> = h
            .broker
            .queued_events("probe.output")
            .into_iter()
            .filter(|e| e.event_type == EventType::WorkerHeartbeat)
            .collect();
        assert_eq!(heartbeats.len(), 2);
        assert_eq!(heartbeats[0].source_worker.as_deref(), Some("pulse"));

        h.runner.stop().await;
        assert!(h.runner.maintenance_task.lock().is_none());
    }
}
