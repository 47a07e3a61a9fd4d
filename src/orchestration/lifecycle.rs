//! # Lifecycle Listener
//!
//! Keeps worker metadata current from bus traffic: heartbeats refresh
//! `last_heartbeat`, task completions and failures move a RUNNING worker
//! back to READY.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::errors::OrchestrationResult;
use super::orchestrator::{OrchestratorInner, WorkerOrchestrator};
use crate::constants::{patterns, queues};
use crate::events::{Event, EventType};
use crate::messaging::{EventHandler, HandlerError, SubscriptionOptions};

struct LifecycleHandler {
    orchestrator: Weak<OrchestratorInner>,
}

#[async_trait]
impl EventHandler for LifecycleHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(inner) = self.orchestrator.upgrade() else {
            return Ok(());
        };
        let orchestrator = WorkerOrchestrator::from_inner(inner);

        let Some(worker) = event
            .source_worker
            .as_deref()
            .or_else(|| event.payload_str("worker_name"))
        else {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Lifecycle event without worker"
            );
            return Ok(());
        };

        match event.event_type {
            EventType::WorkerHeartbeat => {
                if !orchestrator.record_heartbeat(worker).await {
                    debug!(worker = %worker, "Heartbeat from unregistered worker");
                }
            }
            EventType::TaskCompleted | EventType::TaskFailed => {
                if orchestrator.mark_idle(worker).await {
                    debug!(
                        worker = %worker,
                        event_type = %event.event_type,
                        "Worker back to ready"
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "orchestrator_lifecycle"
    }
}

impl WorkerOrchestrator {
    /// Subscribe `orchestrator.lifecycle` to heartbeat, completion and output
    /// topics and start consuming it
    pub async fn attach_lifecycle_listener(&self) -> OrchestrationResult<()> {
        let bus = Arc::clone(&self.inner.bus);
        let handler = Arc::new(LifecycleHandler {
            orchestrator: self.downgrade(),
        });
        bus.subscribe(
            queues::ORCHESTRATOR_LIFECYCLE,
            [
                patterns::WORKER_HEARTBEAT,
                patterns::TASK_COMPLETED,
                patterns::TASK_FAILED,
                patterns::WORKER_OUTPUT,
            ],
            handler,
            SubscriptionOptions::default(),
        )
        .await?;
        bus.start_consuming(queues::ORCHESTRATOR_LIFECYCLE, false).await?;

        info!(
            queue = queues::ORCHESTRATOR_LIFECYCLE,
            "🎯 ORCHESTRATOR: Lifecycle listener attached"
        );
        Ok(())
    }
}
