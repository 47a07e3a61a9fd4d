//! # Isolated Pool
//!
//! Runs stateless autonomous tasks. Each worker gets `instances_per_worker`
//! capability instances behind a [`RoundRobinBalancer`]; a failed attempt is
//! retried after a fixed delay until the retry budget runs out.
//!
//! Tasks arrive on the `isolated_pool` queue (`autonomous.task.submitted`)
//! and report back with `task.completed` / `task.failed` events keyed by
//! worker, which the orchestrator's lifecycle listener consumes.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::balancer::{RoundRobinBalancer, WorkerInstance};
use super::errors::{PoolError, PoolResult};
use crate::capability::CapabilityFactory;
use crate::config::IsolatedPoolConfig;
use crate::constants::{queues, routing, services};
use crate::events::{Event, EventType, Payload};
use crate::messaging::{EventHandler, HandlerError, MessageBus, SubscriptionOptions};
use crate::models::{AutonomousTask, TaskOutcome, WorkerConfig, WorkerType};
use crate::registry::WorkerDirectory;
use crate::state::StateStore;
use crate::state_machine::TaskStatus;

pub struct IsolatedPool {
    config: IsolatedPoolConfig,
    bus: Arc<MessageBus>,
    directory: Arc<dyn WorkerDirectory>,
    state_store: Arc<dyn StateStore>,
    factory: Arc<dyn CapabilityFactory>,
    balancer: RoundRobinBalancer,
    active_tasks: DashMap<Uuid, AutonomousTask>,
}

impl std::fmt::Debug for IsolatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedPool")
            .field("config", &self.config)
            .field("balancer", &self.balancer)
            .field("active_tasks", &self.active_tasks.len())
            .finish()
    }
}

impl IsolatedPool {
    pub fn new(
        config: IsolatedPoolConfig,
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
            balancer: RoundRobinBalancer::new(),
            active_tasks: DashMap::new(),
        }
    }

    /// Build instances for every enabled autonomous worker, then subscribe to
    /// task submissions and start consuming
    pub async fn initialize(self: &Arc<Self>) -> PoolResult<()> {
        match self.directory.workers_by_type(WorkerType::Autonomous).await {
            Ok(workers) => {
                for config in workers.iter().filter(|c| !c.is_continuous()) {
                    if let Err(e) = self.initialize_worker(config).await {
                        warn!(
                            worker = %config.name,
                            error = %e,
                            "🧪 ISOLATED: Worker initialization failed"
                        );
                    }
                }
            }
            Err(e) => warn!(
                error = %e,
                "🧪 ISOLATED: Worker directory unavailable, initializing lazily"
            ),
        }

        let handler = Arc::new(TaskSubmittedHandler {
            pool: Arc::downgrade(self),
        });
        self.bus
            .subscribe(
                queues::ISOLATED_POOL,
                [routing::AUTONOMOUS_TASK_SUBMITTED],
                handler,
                SubscriptionOptions::default(),
            )
            .await?;
        self.bus.start_consuming(queues::ISOLATED_POOL, false).await?;

        info!(
            workers = ?self.balancer.workers(),
            "🧪 ISOLATED: Pool initialized"
        );
        Ok(())
    }

    /// Create `instances_per_worker` capability instances for `config`
    ///
    /// Instances that fail to build are skipped; the call fails only when none
    /// could be created.
    pub async fn initialize_worker(&self, config: &WorkerConfig) -> PoolResult<usize> {
        let api_key = self.directory.get_secret(&config.capability.secret_key()).await;
        let offset = self.balancer.instance_count(&config.name);

        let mut created = 0;
        let mut last_error = None;
        for i in 0..self.config.instances_per_worker {
            match self.factory.create(config, api_key.clone()) {
                Ok(capability) => {
                    self.balancer.register_instance(WorkerInstance::new(
                        format!("{}_instance_{}", config.name, offset + i),
                        &config.name,
                        capability,
                    ));
                    created += 1;
                }
                Err(e) => {
                    error!(
                        worker = %config.name,
                        instance = offset + i,
                        error = %e,
                        "🧪 ISOLATED: Failed to create instance"
                    );
                    last_error = Some(e);
                }
            }
        }

        match (created, last_error) {
            (0, Some(e)) => Err(e.into()),
            _ => {
                info!(
                    worker = %config.name,
                    instances = created,
                    "🧪 ISOLATED: Worker initialized"
                );
                Ok(created)
            }
        }
    }

    /// Run one task to completion, retrying failed attempts
    #[instrument(skip(self, input), fields(worker = %worker_name))]
    pub async fn execute(
        &self,
        worker_name: &str,
        input: Value,
        execution_id: Option<Uuid>,
    ) -> TaskOutcome {
        let execution_id = execution_id.unwrap_or_else(Uuid::now_v7);
        let mut task = AutonomousTask::new(
            worker_name,
            execution_id,
            input,
            self.config.max_retries,
        );
        task.status = TaskStatus::InProgress;
        self.active_tasks.insert(task.id, task.clone());

        loop {
            match self.attempt(&task).await {
                Ok(result) => {
                    task.mark_completed(result);
                    self.finish(&task).await;
                    return TaskOutcome::from(&task);
                }
                Err(e) if task.can_retry() => {
                    task.retry_count += 1;
                    task.status = TaskStatus::Retrying;
                    task.error = Some(e.to_string());
                    self.active_tasks.insert(task.id, task.clone());
                    warn!(
                        task_id = %task.id,
                        execution_id = %execution_id,
                        retry_count = task.retry_count,
                        max_retries = task.max_retries,
                        error = %e,
                        "🧪 ISOLATED: Task attempt failed, retrying"
                    );

                    tokio::time::sleep(self.config.retry_delay()).await;
                    task.status = TaskStatus::InProgress;
                    self.active_tasks.insert(task.id, task.clone());
                }
                Err(e) => {
                    task.mark_failed(e.to_string());
                    self.finish(&task).await;
                    return TaskOutcome::from(&task);
                }
            }
        }
    }

    async fn attempt(&self, task: &AutonomousTask) -> PoolResult<String> {
        let instance = self
            .balancer
            .next(&task.worker_name)
            .ok_or_else(|| PoolError::no_instances(&task.worker_name))?;

        let prompt = task.input.get("prompt").and_then(Value::as_str).unwrap_or_default();
        let mut context = Payload::new();
        context.insert("task_id".to_string(), json!(task.id.to_string()));
        context.insert("execution_id".to_string(), json!(task.execution_id.to_string()));
        context.insert("input".to_string(), task.input.clone());

        debug!(
            task_id = %task.id,
            instance_id = %instance.instance_id,
            attempt = task.attempts(),
            "Executing task"
        );
        let response = instance.capability().execute(prompt, &context).await?;
        instance.record_task();
        Ok(response.response)
    }

    /// Persist the final record, publish the outcome and stop tracking
    async fn finish(&self, task: &AutonomousTask) {
        let duration = task.duration_seconds();
        let (record, event_type, routing_key) = match task.status {
            TaskStatus::Completed => (
                json!(task.result),
                EventType::TaskCompleted,
                routing::autonomous_task_completed(&task.worker_name),
            ),
            _ => (
                json!({ "error": task.error }),
                EventType::TaskFailed,
                routing::autonomous_task_failed(&task.worker_name),
            ),
        };

        if let Err(e) = self
            .state_store
            .save_execution_result(
                &task.worker_name,
                task.execution_id,
                &task.status.to_string(),
                record,
                duration,
            )
            .await
        {
            error!(
                task_id = %task.id,
                error = %e,
                "🧪 ISOLATED: Failed to persist execution result"
            );
        }

        let mut payload = Payload::new();
        payload.insert("execution_id".to_string(), json!(task.execution_id.to_string()));
        payload.insert("worker_name".to_string(), json!(task.worker_name));
        payload.insert("retry_count".to_string(), json!(task.retry_count));
        payload.insert("duration_seconds".to_string(), json!(duration));
        match task.status {
            TaskStatus::Completed => payload.insert("result".to_string(), json!(task.result)),
            _ => payload.insert("error".to_string(), json!(task.error)),
        };

        let event = Event::task_event(event_type, &task.worker_name, &task.id.to_string(), payload)
            .with_source_service(services::ISOLATED_POOL)
            .with_execution_id(task.execution_id);
        if !self.bus.publish(&event, Some(&routing_key)).await {
            warn!(
                task_id = %task.id,
                routing_key = %routing_key,
                "🧪 ISOLATED: Failed to publish task outcome"
            );
        }

        self.active_tasks.remove(&task.id);

        if task.status == TaskStatus::Completed {
            info!(
                task_id = %task.id,
                execution_id = %task.execution_id,
                attempts = task.attempts(),
                duration_seconds = duration,
                "🧪 ISOLATED: Task completed"
            );
        } else {
            error!(
                task_id = %task.id,
                execution_id = %task.execution_id,
                attempts = task.attempts(),
                error = ?task.error,
                "🧪 ISOLATED: Task failed after retries"
            );
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.active_tasks.len()
    }

    pub fn active_tasks(&self) -> Vec<AutonomousTask> {
        self.active_tasks.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn instance_count(&self, worker_name: &str) -> usize {
        self.balancer.instance_count(worker_name)
    }

    /// Make sure `worker_name` has instances, building them from the payload
    /// config or the directory on first use
    async fn ensure_worker(
        &self,
        worker_name: &str,
        payload_config: Option<&Value>,
    ) -> PoolResult<()> {
        if self.balancer.instance_count(worker_name) > 0 {
            return Ok(());
        }

        let config = match payload_config {
            Some(value) => serde_json::from_value::<WorkerConfig>(value.clone())
                .map_err(|e| PoolError::invalid_payload(format!("worker config: {e}")))?,
            None => self
                .directory
                .worker(worker_name)
                .await
                .ok()
                .flatten()
                .ok_or_else(|| PoolError::no_instances(worker_name))?,
        };
        self.initialize_worker(&config).await.map(|_| ())
    }
}

struct TaskSubmittedHandler {
    pool: Weak<IsolatedPool>,
}

#[async_trait]
impl EventHandler for TaskSubmittedHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };

        let Some(worker_name) = event.payload_str("worker_name") else {
            error!(event_id = %event.id, "🧪 ISOLATED: Task submission without worker_name");
            return Ok(());
        };

        let execution_id = event
            .payload_str("execution_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .or(event.execution_id);
        let input = event.payload.get("input").cloned().unwrap_or_else(|| json!({}));

        // Unbuildable workers still go through execute so the failure is
        // recorded and published like any other.
        if let Err(e) = pool.ensure_worker(worker_name, event.payload.get("config")).await {
            warn!(worker = %worker_name, error = %e, "🧪 ISOLATED: Could not initialize worker");
        }

        pool.execute(worker_name, input, execution_id).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "isolated_pool_tasks"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityResponse;
    use crate::registry::InMemoryWorkerDirectory;
    use crate::state::InMemoryStateStore;
    use crate::test_utils::{
        autonomous_worker, connected_bus, probe_queue, wait_until, EchoCapability,
        FailingCapability,
        ScriptedCapability, StaticCapabilityFactory,
    };
    use crate::capability::CapabilityError;
    use crate::messaging::InMemoryBroker;
    use std::time::Duration;

    struct Harness {
        pool: Arc<IsolatedPool>,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStateStore>,
        directory: InMemoryWorkerDirectory,
    }

    async fn harness(config: IsolatedPoolConfig, factory: StaticCapabilityFactory) -> Harness {
        let (bus, broker) = connected_bus().await;
        probe_queue(&bus, "probe.outcomes", ["autonomous.task.#"]).await;
        let store = Arc::new(InMemoryStateStore::new());
        let directory = InMemoryWorkerDirectory::new();
        let pool = Arc::new(IsolatedPool::new(
            config,
            bus,
            Arc::new(directory.clone()),
            store.clone(),
            Arc::new(factory),
        ));
        Harness {
            pool,
            broker,
            store,
            directory,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_retries_then_publishes_failure() {
        let failing = Arc::new(FailingCapability::default());
        let h = harness(
            IsolatedPoolConfig::default(),
            StaticCapabilityFactory::new().with_default(failing.clone()),
        )
        .await;
        h.pool.initialize_worker(&autonomous_worker("flaky")).await.unwrap();

        let execution_id = Uuid::now_v7();
        let started = tokio::time::Instant::now();
        let outcome = h
            .pool
            .execute("flaky", json!({"prompt": "try"}), Some(execution_id))
            .await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.execution_id, execution_id);
        assert_eq!(failing.call_count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(h.pool.active_task_count(), 0);

        let record = h.store.latest_execution(execution_id).unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.result["error"], "Capability execution failed: capability unavailable");

        let published = h.broker.queued_events("probe.outcomes");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, EventType::TaskFailed);
        assert_eq!(published[0].source_worker.as_deref(), Some("flaky"));
        assert_eq!(published[0].payload["retry_count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let scripted = Arc::new(ScriptedCapability::new([
            Err(CapabilityError::execution("rate limited")),
            Ok(CapabilityResponse::text("done")),
        ]));
        let h = harness(
            IsolatedPoolConfig::default(),
            StaticCapabilityFactory::new().with_default(scripted.clone()),
        )
        .await;
        h.pool.initialize_worker(&autonomous_worker("steady")).await.unwrap();

        let outcome = h.pool.execute("steady", json!({"prompt": "go"}), None).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.result.as_deref(), Some("done"));
        assert_eq!(outcome.attempts, 2);

        let calls = scripted.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].prompt, "go");
        assert_eq!(calls[0].context["execution_id"], calls[1].context["execution_id"]);
        assert_eq!(calls[1].context["input"], json!({"prompt": "go"}));

        let published = h.broker.queued_events("probe.outcomes");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, EventType::TaskCompleted);
        assert_eq!(published[0].payload["result"], "done");
        assert_eq!(h.store.latest_execution(outcome.execution_id).unwrap().status, "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_instances_follow_retry_policy() {
        let h = harness(IsolatedPoolConfig::default(), StaticCapabilityFactory::new()).await;
        let outcome = h.pool.execute("ghost", json!({}), None).await;
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.unwrap().contains("No instances available"));
    }

    #[tokio::test]
    async fn test_instances_rotate_and_use_directory_secret() {
        let factory = StaticCapabilityFactory::new()
            .with_default(Arc::new(EchoCapability::default()))
            .requiring_api_key();
        let config = IsolatedPoolConfig {
            instances_per_worker: 3,
            ..IsolatedPoolConfig::default()
        };
        let h = harness(config, factory).await;
        let worker = autonomous_worker("echo");

        let err = h.pool.initialize_worker(&worker).await.unwrap_err();
        assert!(matches!(err, PoolError::Capability(CapabilityError::MissingApiKey { .. })));

        h.directory.set_secret(worker.capability.secret_key(), "sk-test").await;
        assert_eq!(h.pool.initialize_worker(&worker).await.unwrap(), 3);
        assert_eq!(h.pool.instance_count("echo"), 3);

        for _ in 0..6 {
            assert!(h.pool.execute("echo", json!({"prompt": "hi"}), None).await.is_success());
        }
        let picked: Vec<u64> = (0..3)
            .map(|_| h.pool.balancer.next("echo").unwrap().task_count())
            .collect();
        assert_eq!(picked, vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn test_submission_lazily_initializes_from_payload_config() {
        let echo = Arc::new(EchoCapability::default());
        let h = harness(
            IsolatedPoolConfig {
                retry_delay_seconds: 0,
                ..IsolatedPoolConfig::default()
            },
            StaticCapabilityFactory::new().with_default(echo.clone()),
        )
        .await;
        h.pool.initialize().await.unwrap();

        let execution_id = Uuid::now_v7();
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!("lazy"));
        payload.insert("execution_id".to_string(), json!(execution_id.to_string()));
        payload.insert("input".to_string(), json!({"prompt": "wake up"}));
        payload.insert(
            "config".to_string(),
            serde_json::to_value(autonomous_worker("lazy")).unwrap(),
        );
        let submitted = Event::new(EventType::TaskSubmitted).with_payload(payload);
        assert!(h.pool.bus.publish(&submitted, Some(routing::AUTONOMOUS_TASK_SUBMITTED)).await);

        let store = h.store.clone();
        wait_until(move || store.latest_execution(execution_id).is_some()).await;
        assert_eq!(h.pool.instance_count("lazy"), 1);
        assert_eq!(echo.call_count(), 1);

        let record = h.store.latest_execution(execution_id).unwrap();
        assert_eq!(record.result, json!("echo: wake up"));
    }

    #[tokio::test]
    async fn test_submission_without_worker_name_is_acknowledged() {
        let h = harness(IsolatedPoolConfig::default(), StaticCapabilityFactory::new()).await;
        h.pool.initialize().await.unwrap();

        let submitted = Event::new(EventType::TaskSubmitted);
        assert!(h.pool.bus.publish(&submitted, Some(routing::AUTONOMOUS_TASK_SUBMITTED)).await);

        let bus = Arc::clone(&h.pool.bus);
        wait_until(move || bus.stats().handled == 1).await;
        assert_eq!(h.pool.bus.stats().handler_errors, 0);
        assert_eq!(h.broker.queue_length(&queues::dead_letter_queue(queues::ISOLATED_POOL)), 0);
    }
}
