//! # Health Monitoring
//!
//! Every `health_check_interval` the orchestrator reconciles its registry
//! with the worker directory, then checks each live worker's heartbeat and
//! restarts the unhealthy ones within the restart budget.

use serde::Serialize;
use std::collections::HashSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::orchestrator::WorkerOrchestrator;
use crate::state_machine::WorkerStatus;

/// What one health tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub registered: Vec<String>,
    pub deregistered: Vec<String>,
    pub unhealthy: Vec<String>,
    pub restarted: Vec<String>,
    pub restart_failed: Vec<String>,
}

impl WorkerOrchestrator {
    pub(super) fn spawn_health_loop(&self) {
        let orchestrator = self.clone();
        let token = self.inner.shutdown.child_token();
        let interval = self.inner.config.health_check_interval();

        let handle = tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "🏥 HEALTH: Monitoring loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = orchestrator.health_tick().await;
                        debug!(report = ?report, "Health tick complete");
                    }
                }
            }
            info!("🏥 HEALTH: Monitoring loop stopped");
        });

        *self.inner.health_task.lock() = Some(handle);
    }

    /// Run one reconcile-and-check pass
    pub async fn health_tick(&self) -> HealthReport {
        let mut report = HealthReport::default();
        if self.is_shutdown_requested() {
            return report;
        }

        self.reconcile(&mut report).await;

        let candidates: Vec<(String, WorkerStatus)> = {
            let registry = self.inner.registry.read().await;
            let mut candidates: Vec<(String, WorkerStatus)> = registry
                .iter()
                .filter(|(_, r)| !r.metadata.status.is_terminal() && !r.metadata.restarts_exhausted)
                .map(|(name, r)| (name.clone(), r.metadata.status))
                .collect();
            candidates.sort_by(|a, b| a.0.cmp(&b.0));
            candidates
        };

        for (name, status) in candidates {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            report.checked += 1;

            let healthy = self.health_check(&name).await;
            if healthy && status != WorkerStatus::Failed {
                continue;
            }
            report.unhealthy.push(name.clone());

            if status.is_active() {
                self.mark_unavailable(&name).await;
            }
            if self.restart(&name).await {
                report.restarted.push(name);
            } else {
                report.restart_failed.push(name);
            }
        }

        if !report.unhealthy.is_empty() {
            info!(
                unhealthy = ?report.unhealthy,
                restarted = ?report.restarted,
                restart_failed = ?report.restart_failed,
                "🏥 HEALTH: Tick handled unhealthy workers"
            );
        }
        report
    }

    async fn mark_unavailable(&self, name: &str) {
        let mut registry = self.inner.registry.write().await;
        if let Some(registration) = registry.get_mut(name) {
            if let Err(e) = registration.metadata.transition(name, WorkerStatus::Unavailable) {
                warn!(worker = %name, error = %e, "Could not mark worker unavailable");
            }
        }
    }

    /// Register newly enabled workers and drop vanished or disabled ones
    ///
    /// A directory failure skips reconciliation for this tick.
    async fn reconcile(&self, report: &mut HealthReport) {
        let enabled = match self.inner.directory.enabled_workers().await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(
                    error = %e,
                    "🏥 HEALTH: Worker directory unavailable, skipping reconciliation"
                );
                return;
            }
        };

        let registered: HashSet<String> =
            self.inner.registry.read().await.keys().cloned().collect();
        let enabled_names: HashSet<String> = enabled.iter().map(|c| c.name.clone()).collect();

        for config in enabled {
            if registered.contains(&config.name) {
                continue;
            }
            let name = config.name.clone();
            match self.register(config).await {
                Ok(_) => report.registered.push(name),
                Err(e) => warn!(
                    worker = %name,
                    error = %e,
                    "🏥 HEALTH: Could not register new worker"
                ),
            }
        }

        let mut vanished: Vec<&String> = registered.difference(&enabled_names).collect();
        vanished.sort();
        for name in vanished {
            if self.deregister(name).await {
                report.deregistered.push(name.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::registry::InMemoryWorkerDirectory;
    use crate::state::InMemoryStateStore;
    use crate::test_utils::{autonomous_worker, connected_bus};
    use std::sync::Arc;
    use std::time::Duration;

    async fn orchestrator_with(directory: InMemoryWorkerDirectory) -> WorkerOrchestrator {
        let (bus, _broker) = connected_bus().await;
        WorkerOrchestrator::new(
            OrchestratorConfig::default(),
            bus,
            Arc::new(directory),
            Arc::new(InMemoryStateStore::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeat_restarts_once_per_tick_until_failed() {
        let directory = InMemoryWorkerDirectory::new();
        directory.upsert(autonomous_worker("stale")).await;
        let orchestrator = orchestrator_with(directory).await;
        orchestrator.health_tick().await;
        assert_eq!(orchestrator.status("stale").await, Some(WorkerStatus::Ready));

        orchestrator.record_heartbeat("stale").await;
        tokio::time::advance(Duration::from_secs(61)).await;

        for attempt in 1..=3 {
            let report = orchestrator.health_tick().await;
            assert_eq!(report.restarted, vec!["stale"], "tick {attempt}");
            let snapshot = orchestrator.snapshot("stale").await.unwrap();
            assert_eq!(snapshot.restart_count, attempt);
            assert_eq!(snapshot.status, WorkerStatus::Ready);
        }

        let report = orchestrator.health_tick().await;
        assert_eq!(report.restart_failed, vec!["stale"]);
        assert_eq!(orchestrator.status("stale").await, Some(WorkerStatus::Failed));

        let report = orchestrator.health_tick().await;
        assert_eq!(report.checked, 0);
        assert!(report.unhealthy.is_empty());
        assert_eq!(orchestrator.snapshot("stale").await.unwrap().restart_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_heartbeat_is_left_alone() {
        let directory = InMemoryWorkerDirectory::new();
        directory.upsert(autonomous_worker("fresh")).await;
        let orchestrator = orchestrator_with(directory).await;
        orchestrator.health_tick().await;

        orchestrator.record_heartbeat("fresh").await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let report = orchestrator.health_tick().await;
        assert_eq!(report.checked, 1);
        assert!(report.unhealthy.is_empty());
        assert_eq!(orchestrator.snapshot("fresh").await.unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn test_reconcile_follows_directory() {
        let directory = InMemoryWorkerDirectory::new();
        directory.upsert(autonomous_worker("keep")).await;
        directory.upsert(autonomous_worker("drop")).await;
        let orchestrator = orchestrator_with(directory.clone()).await;

        let report = orchestrator.health_tick().await;
        assert_eq!(report.registered, vec!["drop", "keep"]);

        directory.set_enabled("drop", false).await;
        directory.upsert(autonomous_worker("new")).await;

        let report = orchestrator.health_tick().await;
        assert_eq!(report.registered, vec!["new"]);
        assert_eq!(report.deregistered, vec!["drop"]);
        assert!(orchestrator.status("drop").await.is_none());
        assert_eq!(orchestrator.worker_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_on_interval_and_stops_on_shutdown() {
        let directory = InMemoryWorkerDirectory::new();
        let orchestrator = orchestrator_with(directory.clone()).await;
        orchestrator.initialize().await.unwrap();
        assert_eq!(orchestrator.worker_count().await, 0);

        directory.upsert(autonomous_worker("late")).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(orchestrator.status("late").await, Some(WorkerStatus::Ready));

        orchestrator.shutdown(Some(Duration::from_secs(1))).await;
        assert!(orchestrator.inner.health_task.lock().is_none());
        assert_eq!(orchestrator.status("late").await, Some(WorkerStatus::Shutdown));
    }
}
