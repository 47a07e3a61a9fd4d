#![allow(dead_code)]

pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use agentrunner_core::capability::SequentialPlanner;
use agentrunner_core::config::{IsolatedPoolConfig, OrchestratorConfig, PersistentRunnerConfig};
use agentrunner_core::messaging::{InMemoryBroker, MessageBus};
use agentrunner_core::models::WorkerConfig;
use agentrunner_core::orchestration::WorkerOrchestrator;
use agentrunner_core::pools::{IsolatedPool, PersistentRunner, PlanningPool};
use agentrunner_core::registry::InMemoryWorkerDirectory;
use agentrunner_core::state::InMemoryStateStore;
use agentrunner_core::state_machine::WorkerStatus;
use agentrunner_core::test_utils::{connected_bus, StaticCapabilityFactory};

/// Orchestrator plus all three pools wired over one in-memory bus
pub struct AgentSystem {
    pub bus: Arc<MessageBus>,
    pub broker: Arc<InMemoryBroker>,
    pub directory: Arc<InMemoryWorkerDirectory>,
    pub store: Arc<InMemoryStateStore>,
    pub orchestrator: WorkerOrchestrator,
    pub isolated: Arc<IsolatedPool>,
    pub planning: Arc<PlanningPool>,
    pub runner: Arc<PersistentRunner>,
}

impl AgentSystem {
    /// Pools subscribe before the orchestrator starts its workers so that
    /// start announcements and routed tasks always find a bound queue
    pub async fn start(workers: Vec<WorkerConfig>, factory: StaticCapabilityFactory) -> Self {
        let (bus, broker) = connected_bus().await;
        let directory = Arc::new(InMemoryWorkerDirectory::new());
        for worker in workers {
            directory.upsert(worker).await;
        }
        let store = Arc::new(InMemoryStateStore::new());
        let factory = Arc::new(factory);

        let isolated = Arc::new(IsolatedPool::new(
            IsolatedPoolConfig {
                instances_per_worker: 2,
                max_retries: 1,
                retry_delay_seconds: 0,
            },
            Arc::clone(&bus),
            directory.clone(),
            store.clone(),
            factory.clone(),
        ));
        let planning = Arc::new(PlanningPool::new(
            Arc::clone(&bus),
            directory.clone(),
            store.clone(),
            factory.clone(),
            Arc::new(SequentialPlanner),
        ));
        let runner = Arc::new(PersistentRunner::new(
            PersistentRunnerConfig::default(),
            Arc::clone(&bus),
            directory.clone(),
            store.clone(),
            factory,
        ));
        isolated.initialize().await.expect("isolated pool initializes");
        planning.initialize().await.expect("planning pool initializes");
        runner.initialize().await.expect("persistent runner initializes");

        let orchestrator = WorkerOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::clone(&bus),
            directory.clone(),
            store.clone(),
        );
        orchestrator.initialize().await.expect("orchestrator initializes");

        Self {
            bus,
            broker,
            directory,
            store,
            orchestrator,
            isolated,
            planning,
            runner,
        }
    }

    pub async fn wait_for_status(&self, worker: &str, status: WorkerStatus) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while self.orchestrator.status(worker).await != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            reached.is_ok(),
            "worker {worker} never reached {status}, last seen {:?}",
            self.orchestrator.status(worker).await
        );
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown(Some(Duration::from_secs(2))).await;
        self.runner.stop().await;
        self.bus.close().await.expect("bus closes");
    }
}
