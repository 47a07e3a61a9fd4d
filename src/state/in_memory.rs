//! In-process [`StateStore`] for tests and single-node development.
//!
//! Every checkpoint is kept (latest last), so tests can assert on save counts
//! as well as contents. Failures can be injected per operation family.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{ExecutionRecord, StateStore, StateStoreError, StateStoreResult};
use crate::events::Payload;

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<String, Vec<Payload>>,
    executions: DashMap<Uuid, Vec<ExecutionRecord>>,
    plans: DashMap<Uuid, Payload>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail until reset
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_writes(&self, operation: &str) -> StateStoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StateStoreError::operation(operation, "injected write failure"));
        }
        Ok(())
    }

    pub fn latest_state(&self, worker_name: &str) -> Option<Payload> {
        self.states
            .get(worker_name)
            .and_then(|versions| versions.last().cloned())
    }

    pub fn save_count(&self, worker_name: &str) -> usize {
        self.states.get(worker_name).map_or(0, |versions| versions.len())
    }

    /// Every record written for an execution, oldest first
    pub fn execution_records(&self, execution_id: Uuid) -> Vec<ExecutionRecord> {
        self.executions
            .get(&execution_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn latest_execution(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.executions
            .get(&execution_id)
            .and_then(|records| records.last().cloned())
    }

    /// Records written by one worker across executions
    pub fn records_for_worker(&self, worker_name: &str) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|record| record.worker_name == worker_name)
            .collect();
        records.sort_by_key(|record| record.recorded_at);
        records
    }

    pub fn plan_state(&self, plan_id: Uuid) -> Option<Payload> {
        self.plans.get(&plan_id).map(|state| state.clone())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_state(&self, worker_name: &str, state: Payload) -> StateStoreResult<()> {
        self.check_writes("save_state")?;
        self.states.entry(worker_name.to_string()).or_default().push(state);
        Ok(())
    }

    async fn load_latest_state(&self, worker_name: &str) -> StateStoreResult<Option<Payload>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StateStoreError::unavailable("injected read failure"));
        }
        Ok(self.latest_state(worker_name))
    }

    async fn save_execution_result(
        &self,
        worker_name: &str,
        execution_id: Uuid,
        status: &str,
        result: Value,
        duration_seconds: f64,
    ) -> StateStoreResult<()> {
        self.check_writes("save_execution_result")?;
        self.executions
            .entry(execution_id)
            .or_default()
            .push(ExecutionRecord {
                worker_name: worker_name.to_string(),
                execution_id,
                status: status.to_string(),
                result,
                duration_seconds,
                recorded_at: Utc::now(),
            });
        Ok(())
    }

    async fn update_plan_state(&self, plan_id: Uuid, state: Payload) -> StateStoreResult<()> {
        self.check_writes("update_plan_state")?;
        self.plans.insert(plan_id, state);
        Ok(())
    }
}
