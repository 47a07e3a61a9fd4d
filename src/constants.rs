//! # System Constants
//!
//! Exchange names, queue names and routing keys shared by the bus, the
//! orchestrator and the execution pools, plus the default operational limits.

/// Exchange names on the broker
pub mod exchanges {
    /// Main topic exchange every event is published to
    pub const MAIN: &str = "agent_events";
    /// Direct exchange receiving dead-lettered messages
    pub const DEAD_LETTER: &str = "agent_events_dlx";
}

/// Queue names owned by the system components
pub mod queues {
    pub const ISOLATED_POOL: &str = "isolated_pool";
    pub const PLANNING_POOL: &str = "planning_pool";
    pub const PLANNING_CLARIFICATION: &str = "planning_clarification";
    pub const PERSISTENT_RUNNER_CONTROL: &str = "persistent_runner.control";
    pub const ORCHESTRATOR_LIFECYCLE: &str = "orchestrator.lifecycle";

    /// Prefix for dead-letter queues: `dlq.{queue}`
    pub const DLQ_PREFIX: &str = "dlq";

    /// Queue an event-driven worker consumes from
    pub fn worker_queue(worker_name: &str) -> String {
        format!("agent.{worker_name}")
    }

    /// Dedicated input queue of a continuous worker
    pub fn worker_input_queue(worker_name: &str) -> String {
        format!("agent.input.{worker_name}")
    }

    /// Dead-letter queue (and dead-letter routing key) for a queue
    pub fn dead_letter_queue(queue_name: &str) -> String {
        format!("{DLQ_PREFIX}.{queue_name}")
    }
}

/// Routing keys and routing-key builders
pub mod routing {
    pub const COLLABORATIVE_TASK_SUBMITTED: &str = "collaborative.task.submitted";
    pub const AUTONOMOUS_TASK_SUBMITTED: &str = "autonomous.task.submitted";

    pub fn continuous_task(worker_name: &str) -> String {
        format!("continuous.task.{worker_name}")
    }

    pub fn continuous_start(worker_name: &str) -> String {
        format!("continuous.start.{worker_name}")
    }

    pub fn worker_input(worker_name: &str) -> String {
        format!("agent.input.{worker_name}")
    }

    pub fn worker_output(worker_name: &str) -> String {
        format!("agent.output.{worker_name}")
    }

    pub fn worker_shutdown(worker_name: &str) -> String {
        format!("agent.shutdown.{worker_name}")
    }

    pub fn worker_heartbeat(worker_name: &str) -> String {
        format!("agent.heartbeat.{worker_name}")
    }

    pub fn autonomous_task_completed(worker_name: &str) -> String {
        format!("autonomous.task.completed.{worker_name}")
    }

    pub fn autonomous_task_failed(worker_name: &str) -> String {
        format!("autonomous.task.failed.{worker_name}")
    }

    pub fn collaborative_task_completed(worker_name: &str) -> String {
        format!("collaborative.task.completed.{worker_name}")
    }

    pub fn collaborative_task_failed(worker_name: &str) -> String {
        format!("collaborative.task.failed.{worker_name}")
    }

    pub fn step_completed(plan_id: &str) -> String {
        format!("collaboration.step.completed.{plan_id}")
    }

    pub fn plan_failed(plan_id: &str) -> String {
        format!("collaboration.failed.{plan_id}")
    }

    pub fn plan_completed(plan_id: &str) -> String {
        format!("collaboration.completed.{plan_id}")
    }

    pub fn clarification_request(plan_id: &str) -> String {
        format!("collaboration.clarification.request.{plan_id}")
    }

    pub fn clarification_response(plan_id: &str) -> String {
        format!("collaboration.clarification.response.{plan_id}")
    }
}

/// Binding patterns used by system subscriptions
pub mod patterns {
    pub const CLARIFICATION_RESPONSE: &str = "collaboration.clarification.response.#";
    pub const CONTINUOUS_START: &str = "continuous.start.*";
    pub const WORKER_SHUTDOWN: &str = "agent.shutdown.*";
    pub const WORKER_HEARTBEAT: &str = "agent.heartbeat.#";
    pub const TASK_COMPLETED: &str = "#.task.completed.#";
    pub const TASK_FAILED: &str = "#.task.failed.#";
    pub const WORKER_OUTPUT: &str = "agent.output.#";
}

/// Service identifiers written into `source_service` and execution records
pub mod services {
    pub const ORCHESTRATOR: &str = "worker_orchestrator";
    pub const ISOLATED_POOL: &str = "isolated_pool";
    pub const PLANNING_POOL: &str = "planning_pool";
    pub const PERSISTENT_RUNNER: &str = "persistent_runner";
}

/// Default operational limits
pub mod defaults {
    /// Bus-level redelivery ceiling before dead-lettering
    pub const MAX_DELIVERY_RETRIES: u32 = 3;
    pub const PREFETCH_COUNT: u16 = 1;
    pub const CONNECTION_TIMEOUT_SECONDS: u64 = 10;
    pub const RECONNECT_DELAY_MS: u64 = 1_000;

    pub const HEALTH_CHECK_INTERVAL_SECONDS: u64 = 60;
    pub const MAX_RESTART_ATTEMPTS: u32 = 3;
    pub const SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

    pub const INSTANCES_PER_WORKER: usize = 1;
    pub const TASK_MAX_RETRIES: u32 = 2;
    pub const TASK_RETRY_DELAY_SECONDS: u64 = 5;

    pub const SAVE_INTERVAL_SECONDS: u64 = 300;
    pub const IDLE_TIMEOUT_SECONDS: u64 = 600;
    pub const IDLE_CHECK_INTERVAL_SECONDS: u64 = 60;
    pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
    pub const CONTEXT_WINDOW: usize = 10;
    pub const HISTORY_RETENTION: usize = 100;

    pub const EVENT_MAX_RETRIES: u32 = 3;
}
