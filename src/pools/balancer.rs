//! # Round-Robin Balancer
//!
//! Spreads tasks for one worker across its capability instances. Selection
//! takes a ticket from an atomic counter, so concurrent callers never skip or
//! double up an instance.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::capability::Capability;

/// One capability instance serving a worker
pub struct WorkerInstance {
    pub instance_id: String,
    pub worker_name: String,
    capability: Arc<dyn Capability>,
    task_count: AtomicU64,
    last_task_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("instance_id", &self.instance_id)
            .field("worker_name", &self.worker_name)
            .field("task_count", &self.task_count())
            .finish()
    }
}

impl WorkerInstance {
    pub fn new(
        instance_id: impl Into<String>,
        worker_name: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            worker_name: worker_name.into(),
            capability,
            task_count: AtomicU64::new(0),
            last_task_at: Mutex::new(None),
        }
    }

    pub fn capability(&self) -> &Arc<dyn Capability> {
        &self.capability
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }

    pub fn last_task_at(&self) -> Option<DateTime<Utc>> {
        *self.last_task_at.lock()
    }

    pub fn record_task(&self) {
        self.task_count.fetch_add(1, Ordering::Relaxed);
        *self.last_task_at.lock() = Some(Utc::now());
    }
}

#[derive(Default)]
struct InstanceRing {
    instances: Vec<Arc<WorkerInstance>>,
    cursor: AtomicUsize,
}

#[derive(Default)]
pub struct RoundRobinBalancer {
    rings: RwLock<HashMap<String, InstanceRing>>,
}

impl std::fmt::Debug for RoundRobinBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rings = self.rings.read();
        let counts: HashMap<&str, usize> = rings
            .iter()
            .map(|(name, ring)| (name.as_str(), ring.instances.len()))
            .collect();
        f.debug_struct("RoundRobinBalancer").field("instances", &counts).finish()
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_instance(&self, instance: WorkerInstance) -> Arc<WorkerInstance> {
        let instance = Arc::new(instance);
        let mut rings = self.rings.write();
        let ring = rings.entry(instance.worker_name.clone()).or_default();
        ring.instances.push(Arc::clone(&instance));

        info!(
            worker = %instance.worker_name,
            instance_id = %instance.instance_id,
            total_instances = ring.instances.len(),
            "⚖️ BALANCER: Registered instance"
        );
        instance
    }

    /// Next instance in strict cyclic order
    pub fn next(&self, worker_name: &str) -> Option<Arc<WorkerInstance>> {
        let rings = self.rings.read();
        let ring = rings.get(worker_name)?;
        if ring.instances.is_empty() {
            return None;
        }
        let ticket = ring.cursor.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&ring.instances[ticket % ring.instances.len()]))
    }

    pub fn instance_count(&self, worker_name: &str) -> usize {
        self.rings
            .read()
            .get(worker_name)
            .map_or(0, |ring| ring.instances.len())
    }

    pub fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rings.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EchoCapability;

    fn balancer_with(worker: &str, count: usize) -> RoundRobinBalancer {
        let balancer = RoundRobinBalancer::new();
        for i in 0..count {
            balancer.register_instance(WorkerInstance::new(
                format!("{worker}_instance_{i}"),
                worker,
                Arc::new(EchoCapability::default()),
            ));
        }
        balancer
    }

    #[test]
    fn test_cyclic_order() {
        let balancer = balancer_with("echo", 3);
        let picked: Vec<String> = (0..7)
            .map(|_| balancer.next("echo").unwrap().instance_id.clone())
            .collect();
        assert_eq!(
            picked,
            vec![
                "echo_instance_0",
                "echo_instance_1",
                "echo_instance_2",
                "echo_instance_0",
                "echo_instance_1",
                "echo_instance_2",
                "echo_instance_0",
            ]
        );
        assert_eq!(balancer.instance_count("echo"), 3);
    }

    #[test]
    fn test_unknown_worker_has_no_instances() {
        let balancer = balancer_with("echo", 1);
        assert!(balancer.next("other").is_none());
        assert_eq!(balancer.instance_count("other"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_selection_is_even() {
        let balancer = Arc::new(balancer_with("echo", 4));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let balancer = Arc::clone(&balancer);
                tokio::spawn(async move {
                    let mut picked = Vec::new();
                    for _ in 0..25 {
                        picked.push(balancer.next("echo").unwrap().instance_id.clone());
                        tokio::task::yield_now().await;
                    }
                    picked
                })
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                *counts.entry(id).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&count| count == 50));
    }
}
