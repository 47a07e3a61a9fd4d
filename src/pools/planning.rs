//! # Planning Pool
//!
//! Runs collaborative plans: a [`Planner`] splits a task into steps assigned
//! to workers, the steps execute strictly in order with every earlier result
//! in context, and the plan can pause for a human clarification between
//! steps.
//!
//! ```text
//! PENDING → IN_PROGRESS ⇄ WAITING_CLARIFICATION
//!               │
//!               ├─→ COMPLETED   (aggregate after the last step)
//!               └─→ FAILED      (any step error)
//! ```
//!
//! A plan runs at most one step at a time. A resume is accepted only for the
//! clarification the plan is suspended on.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::errors::{PoolError, PoolResult};
use crate::capability::{Capability, CapabilityFactory, Planner};
use crate::constants::{patterns, queues, routing, services};
use crate::events::{Event, EventType, Payload};
use crate::messaging::{EventHandler, HandlerError, MessageBus, SubscriptionOptions};
use crate::models::{
    CollaborativePlan, PlanCompletion, PlanSummary, StepOutcome, WorkerRole, WorkerType,
};
use crate::registry::WorkerDirectory;
use crate::state::StateStore;
use crate::state_machine::PlanStatus;

pub struct PlanningPool {
    bus: Arc<MessageBus>,
    directory: Arc<dyn WorkerDirectory>,
    state_store: Arc<dyn StateStore>,
    factory: Arc<dyn CapabilityFactory>,
    planner: Arc<dyn Planner>,
    plans: DashMap<Uuid, CollaborativePlan>,
    /// Plans with a step currently executing
    running_steps: DashSet<Uuid>,
    executors: DashMap<String, Arc<dyn Capability>>,
}

/// Releases a plan's step claim when dropped
struct StepClaim<'a> {
    running_steps: &'a DashSet<Uuid>,
    plan_id: Uuid,
}

impl Drop for StepClaim<'_> {
    fn drop(&mut self) {
        self.running_steps.remove(&self.plan_id);
    }
}

fn transition(plan: &mut CollaborativePlan, to: PlanStatus) -> PoolResult<()> {
    let (plan_id, from) = (plan.id, plan.status);
    plan.transition(to)
        .map_err(|to| PoolError::invalid_plan_transition(plan_id, from, to))
}

impl std::fmt::Debug for PlanningPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningPool")
            .field("active_plans", &self.plans.len())
            .field("executors", &self.executors.len())
            .finish()
    }
}

impl PlanningPool {
    pub fn new(
        bus: Arc<MessageBus>,
        directory: Arc<dyn WorkerDirectory>,
        state_store: Arc<dyn StateStore>,
        factory: Arc<dyn CapabilityFactory>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            bus,
            directory,
            state_store,
            factory,
            planner,
            plans: DashMap::new(),
            running_steps: DashSet::new(),
            executors: DashMap::new(),
        }
    }

    /// Subscribe to collaborative task submissions and clarification
    /// responses and start consuming both queues
    pub async fn initialize(self: &Arc<Self>) -> PoolResult<()> {
        let submissions = Arc::new(PlanSubmittedHandler {
            pool: Arc::downgrade(self),
        });
        self.bus
            .subscribe(
                queues::PLANNING_POOL,
                [routing::COLLABORATIVE_TASK_SUBMITTED],
                submissions,
                SubscriptionOptions::default(),
            )
            .await?;

        let clarifications = Arc::new(ClarificationHandler {
            pool: Arc::downgrade(self),
        });
        self.bus
            .subscribe(
                queues::PLANNING_CLARIFICATION,
                [patterns::CLARIFICATION_RESPONSE],
                clarifications,
                SubscriptionOptions::default(),
            )
            .await?;

        self.bus.start_consuming(queues::PLANNING_POOL, false).await?;
        self.bus.start_consuming(queues::PLANNING_CLARIFICATION, false).await?;

        info!("🧭 PLANNING: Pool initialized");
        Ok(())
    }

    /// Plan `description` across the workers that have a definition in the
    /// directory and persist the initial plan state
    #[instrument(skip(self))]
    pub async fn create_plan(
        &self,
        description: &str,
        available_workers: &[String],
    ) -> PoolResult<CollaborativePlan> {
        let mut participants = Vec::with_capacity(available_workers.len());
        for name in available_workers {
            match self.directory.worker(name).await {
                Ok(Some(_)) => participants.push(name.clone()),
                Ok(None) => warn!(
                    worker = %name,
                    "🧭 PLANNING: Worker definition not found, leaving it out"
                ),
                Err(e) => warn!(
                    worker = %name,
                    error = %e,
                    "🧭 PLANNING: Worker lookup failed, leaving it out"
                ),
            }
        }

        let steps = self.planner.plan(description, &participants).await?;
        let plan = CollaborativePlan::new(description, participants, steps);
        self.persist(&plan).await;
        self.plans.insert(plan.id, plan.clone());

        info!(
            plan_id = %plan.id,
            total_steps = plan.total_steps(),
            participants = ?plan.participating_workers,
            "🧭 PLANNING: Plan created"
        );
        Ok(plan)
    }

    /// Execute step `index`, which must be the plan's next step
    ///
    /// The step is claimed before the capability runs; a second caller for
    /// the same plan gets [`PoolError::StepInProgress`] until it finishes.
    #[instrument(skip(self))]
    pub async fn execute_step(&self, plan_id: Uuid, index: usize) -> PoolResult<StepOutcome> {
        let (step, context, _claim) = {
            let mut plan = self
                .plans
                .get_mut(&plan_id)
                .ok_or_else(|| PoolError::plan_not_found(plan_id))?;
            if !plan.status.is_executable() {
                return Err(PoolError::invalid_plan_state(plan_id, plan.status));
            }
            if index != plan.current_step_index || index >= plan.total_steps() {
                return Err(PoolError::invalid_step_index(plan_id, plan.current_step_index, index));
            }
            if !self.running_steps.insert(plan_id) {
                return Err(PoolError::step_in_progress(plan_id, index));
            }
            let claim = StepClaim {
                running_steps: &self.running_steps,
                plan_id,
            };
            if plan.status == PlanStatus::Pending {
                transition(&mut plan, PlanStatus::InProgress)?;
            }

            let step = plan.steps[index].clone();
            let mut context = Payload::new();
            context.insert("plan_id".to_string(), json!(plan_id.to_string()));
            context.insert("step_index".to_string(), json!(index));
            context.insert("step_description".to_string(), json!(step.description));
            context.insert("previous_results".to_string(), Value::Object(plan.results.clone()));
            context.insert("success_criteria".to_string(), json!(step.success_criteria));
            (step, context, claim)
        };

        info!(
            plan_id = %plan_id,
            step = index + 1,
            worker = %step.assigned_worker,
            "🧭 PLANNING: Executing step"
        );

        let result = match self.executor_for(&step.assigned_worker, plan_id).await {
            Ok(executor) => executor
                .execute(&step.description, &context)
                .await
                .map_err(PoolError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                let outcome = StepOutcome::completed(&step, response.response);
                let plan = self.update_plan(plan_id, |plan| {
                    plan.record_step(index, &outcome);
                    plan.current_step_index = index + 1;
                    Ok(())
                })?;
                self.persist(&plan).await;

                let mut payload = Payload::new();
                payload.insert("step_index".to_string(), json!(index));
                payload.insert("worker_name".to_string(), json!(step.assigned_worker));
                payload.insert("result".to_string(), json!(outcome.result));
                let event = Event::plan_event(EventType::PlanStepCompleted, plan_id, payload);
                self.publish(&event, &routing::step_completed(&plan_id.to_string())).await;

                debug!(plan_id = %plan_id, step_index = index, "Step completed");
                Ok(outcome)
            }
            Err(e) => {
                let outcome = StepOutcome::failed(&step, e.to_string());
                let failed = self.update_plan(plan_id, |plan| {
                    plan.record_step(index, &outcome);
                    transition(plan, PlanStatus::Failed)
                });
                if let Ok(plan) = failed {
                    self.persist(&plan).await;
                }

                let mut payload = Payload::new();
                payload.insert("step_index".to_string(), json!(index));
                payload.insert("worker_name".to_string(), json!(step.assigned_worker));
                payload.insert("error".to_string(), json!(e.to_string()));
                let event = Event::plan_event(EventType::PlanFailed, plan_id, payload);
                self.publish(&event, &routing::plan_failed(&plan_id.to_string())).await;

                error!(
                    plan_id = %plan_id,
                    step_index = index,
                    error = %e,
                    "🧭 PLANNING: Step failed, plan is terminal"
                );
                Err(e)
            }
        }
    }

    /// Suspend an in-progress plan until a clarification response arrives
    #[instrument(skip(self))]
    pub async fn request_clarification(&self, plan_id: Uuid, question: &str) -> PoolResult<String> {
        let clarification_id = Uuid::new_v4().to_string();
        let plan = self.update_plan(plan_id, |plan| {
            transition(plan, PlanStatus::WaitingClarification)?;
            plan.pending_clarification = Some(clarification_id.clone());
            Ok(())
        })?;
        self.persist(&plan).await;

        let mut payload = Payload::new();
        payload.insert("clarification_id".to_string(), json!(clarification_id));
        payload.insert("request".to_string(), json!(question));
        let event = Event::plan_event(EventType::PlanClarificationRequested, plan_id, payload);
        self.publish(&event, &routing::clarification_request(&plan_id.to_string())).await;

        info!(
            plan_id = %plan_id,
            clarification_id = %clarification_id,
            "🧭 PLANNING: Waiting for clarification"
        );
        Ok(clarification_id)
    }

    /// Record the clarification and run the remaining steps
    ///
    /// Only the clarification the plan is waiting on resumes it; anything
    /// else is rejected and leaves the plan as it was. Returns the summary
    /// once the plan finishes, or `None` when it paused for another
    /// clarification.
    #[instrument(skip(self, response))]
    pub async fn resume_with_clarification(
        &self,
        plan_id: Uuid,
        clarification_id: &str,
        response: &str,
    ) -> PoolResult<Option<PlanSummary>> {
        let plan = self.update_plan(plan_id, |plan| {
            if plan.status != PlanStatus::WaitingClarification {
                return Err(PoolError::invalid_plan_state(plan_id, plan.status));
            }
            if plan.pending_clarification.as_deref() != Some(clarification_id) {
                return Err(PoolError::unexpected_clarification(plan_id, clarification_id));
            }
            transition(plan, PlanStatus::InProgress)?;
            plan.pending_clarification = None;
            plan.results.insert(
                CollaborativePlan::clarification_key(clarification_id),
                json!({
                    "response": response,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }),
            );
            Ok(())
        })?;
        self.persist(&plan).await;

        info!(
            plan_id = %plan_id,
            clarification_id = %clarification_id,
            "🧭 PLANNING: Resuming with clarification"
        );
        self.run_plan(plan_id).await
    }

    /// Execute the remaining steps in order, then aggregate
    ///
    /// Stops early with `None` when the plan is waiting for a clarification,
    /// and with the step error when a step fails.
    pub async fn run_plan(&self, plan_id: Uuid) -> PoolResult<Option<PlanSummary>> {
        loop {
            let (status, next_index, done) = {
                let plan = self
                    .plans
                    .get(&plan_id)
                    .ok_or_else(|| PoolError::plan_not_found(plan_id))?;
                (plan.status, plan.current_step_index, plan.all_steps_done())
            };
            if status == PlanStatus::WaitingClarification {
                debug!(plan_id = %plan_id, "Plan paused for clarification");
                return Ok(None);
            }
            if done {
                break;
            }
            self.execute_step(plan_id, next_index).await?;
        }
        self.aggregate(plan_id).await.map(Some)
    }

    /// Close out a plan: persist and publish the summary and forget the plan
    ///
    /// Only a plan whose every step ran moves to `COMPLETED`; a partial plan
    /// keeps its last status and is persisted with `completion: partial`.
    #[instrument(skip(self))]
    pub async fn aggregate(&self, plan_id: Uuid) -> PoolResult<PlanSummary> {
        let (_, mut plan) = self
            .plans
            .remove(&plan_id)
            .ok_or_else(|| PoolError::plan_not_found(plan_id))?;

        let completion = if plan.current_step_index == plan.total_steps() {
            PlanCompletion::Completed
        } else {
            PlanCompletion::Partial
        };
        if completion == PlanCompletion::Completed && plan.status != PlanStatus::Failed {
            if let Err(e) = transition(&mut plan, PlanStatus::Completed) {
                warn!(
                    plan_id = %plan_id,
                    error = %e,
                    "🧭 PLANNING: Plan closed without completing"
                );
            }
        }

        let summary = PlanSummary {
            plan_id,
            description: plan.description.clone(),
            status: completion,
            total_steps: plan.total_steps(),
            completed_steps: plan.current_step_index,
            participating_workers: plan.participating_workers.clone(),
            results: plan.results.clone(),
        };
        let elapsed_ms = (chrono::Utc::now() - plan.created_at).num_milliseconds().max(0);
        let duration = elapsed_ms as f64 / 1_000.0;
        let summary_value = serde_json::to_value(&summary).unwrap_or(Value::Null);

        if let Err(e) = self
            .state_store
            .save_execution_result(
                services::PLANNING_POOL,
                plan_id,
                &completion.to_string(),
                summary_value.clone(),
                duration,
            )
            .await
        {
            error!(plan_id = %plan_id, error = %e, "🧭 PLANNING: Failed to persist plan summary");
        }
        let mut state = plan.state_snapshot();
        state.insert("completion".to_string(), json!(completion));
        if let Err(e) = self.state_store.update_plan_state(plan_id, state).await {
            error!(plan_id = %plan_id, error = %e, "🧭 PLANNING: Failed to persist plan state");
        }

        let mut payload = Payload::new();
        payload.insert("status".to_string(), json!(completion));
        payload.insert("results".to_string(), summary_value);
        let event = Event::plan_event(EventType::PlanCompleted, plan_id, payload);
        self.publish(&event, &routing::plan_completed(&plan_id.to_string())).await;

        info!(
            plan_id = %plan_id,
            status = %completion,
            completed_steps = summary.completed_steps,
            total_steps = summary.total_steps,
            "🧭 PLANNING: Plan aggregated"
        );
        Ok(summary)
    }

    /// A worker's part in `plan`, from the steps assigned to it
    pub fn role_of(worker_name: &str, plan: &CollaborativePlan) -> WorkerRole {
        let mut assigned = plan.steps.iter().filter(|s| s.assigned_worker == worker_name);
        let Some(first) = assigned.next() else {
            return WorkerRole::Observer;
        };
        let last = assigned.last().unwrap_or(first);

        if first.index == 0 {
            WorkerRole::Initiator
        } else if last.index + 1 == plan.total_steps() {
            WorkerRole::Finalizer
        } else {
            WorkerRole::Processor
        }
    }

    pub fn plan(&self, plan_id: Uuid) -> Option<CollaborativePlan> {
        self.plans.get(&plan_id).map(|plan| plan.clone())
    }

    pub fn active_plan_count(&self) -> usize {
        self.plans.len()
    }

    /// Apply `change` and return a copy of the updated plan
    ///
    /// The entry stays locked for the whole change, so checks made inside it
    /// hold when the change lands.
    fn update_plan(
        &self,
        plan_id: Uuid,
        change: impl FnOnce(&mut CollaborativePlan) -> PoolResult<()>,
    ) -> PoolResult<CollaborativePlan> {
        let mut plan = self
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| PoolError::plan_not_found(plan_id))?;
        change(&mut plan)?;
        Ok(plan.clone())
    }

    async fn executor_for(
        &self,
        worker_name: &str,
        plan_id: Uuid,
    ) -> PoolResult<Arc<dyn Capability>> {
        if let Some(executor) = self.executors.get(worker_name) {
            return Ok(Arc::clone(executor.value()));
        }

        let config = self
            .directory
            .worker(worker_name)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| PoolError::no_instances(worker_name))?;
        let api_key = self.directory.get_secret(&config.capability.secret_key()).await;
        let executor = self.factory.create(&config, api_key)?;
        self.executors.insert(worker_name.to_string(), Arc::clone(&executor));

        let role = self
            .plans
            .get(&plan_id)
            .map(|plan| Self::role_of(worker_name, &plan))
            .unwrap_or(WorkerRole::Observer);
        info!(worker = %worker_name, role = %role, "🧭 PLANNING: Executor initialized");
        Ok(executor)
    }

    async fn persist(&self, plan: &CollaborativePlan) {
        if let Err(e) = self.state_store.update_plan_state(plan.id, plan.state_snapshot()).await {
            error!(plan_id = %plan.id, error = %e, "🧭 PLANNING: Failed to persist plan state");
        }
    }

    async fn publish(&self, event: &Event, routing_key: &str) {
        if !self.bus.publish(event, Some(routing_key)).await {
            warn!(
                event_type = %event.event_type,
                routing_key = %routing_key,
                "🧭 PLANNING: Failed to publish plan event"
            );
        }
    }

    /// Tell the orchestrator the submitting worker is done with this task
    ///
    /// A plan paused for clarification counts as handed off.
    async fn report_submission(
        &self,
        worker_name: &str,
        submission: &Event,
        outcome: PoolResult<Option<PlanSummary>>,
    ) {
        let mut payload = Payload::new();
        payload.insert("worker_name".to_string(), json!(worker_name));
        if let Some(execution_id) = submission.payload.get("execution_id") {
            payload.insert("execution_id".to_string(), execution_id.clone());
        }

        let (event_type, routing_key) = match outcome {
            Ok(summary) => {
                if let Some(summary) = summary {
                    payload.insert("plan_id".to_string(), json!(summary.plan_id.to_string()));
                    payload.insert("status".to_string(), json!(summary.status));
                }
                (EventType::TaskCompleted, routing::collaborative_task_completed(worker_name))
            }
            Err(e) => {
                payload.insert("error".to_string(), json!(e.to_string()));
                (EventType::TaskFailed, routing::collaborative_task_failed(worker_name))
            }
        };

        let event = Event::worker_event(event_type, worker_name, payload)
            .with_source_service(services::PLANNING_POOL)
            .with_parent(submission);
        self.publish(&event, &routing_key).await;
    }

    /// Collaborative workers from the directory, used when a submission
    /// names none
    async fn default_participants(&self) -> Vec<String> {
        match self.directory.workers_by_type(WorkerType::Collaborative).await {
            Ok(workers) => workers.into_iter().map(|c| c.name).collect(),
            Err(e) => {
                warn!(error = %e, "🧭 PLANNING: Worker directory unavailable");
                Vec::new()
            }
        }
    }
}

struct PlanSubmittedHandler {
    pool: Weak<PlanningPool>,
}

impl PlanSubmittedHandler {
    /// Submission fields live under `input` when the orchestrator routed the
    /// task, at the top level when published directly
    fn submission(event: &Event) -> &Payload {
        match event.payload.get("input") {
            Some(Value::Object(input)) => input,
            _ => &event.payload,
        }
    }
}

#[async_trait]
impl EventHandler for PlanSubmittedHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };

        let submission = Self::submission(&event);
        let Some(description) = submission
            .get("description")
            .or_else(|| submission.get("prompt"))
            .and_then(Value::as_str)
        else {
            error!(
                event_id = %event.id,
                "🧭 PLANNING: Collaborative submission without description"
            );
            return Ok(());
        };

        let mut workers: Vec<String> = submission
            .get("workers")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if workers.is_empty() {
            workers = pool.default_participants().await;
        }

        // Plan failures are terminal and already published; redelivery would
        // only create a duplicate plan.
        let outcome = match pool.create_plan(description, &workers).await {
            Ok(plan) => match pool.run_plan(plan.id).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    warn!(
                        plan_id = %plan.id,
                        error = %e,
                        "🧭 PLANNING: Plan failed, closing it out"
                    );
                    if let Err(e) = pool.aggregate(plan.id).await {
                        debug!(plan_id = %plan.id, error = %e, "Failed plan already closed");
                    }
                    Err(e)
                }
            },
            Err(e) => {
                error!(event_id = %event.id, error = %e, "🧭 PLANNING: Could not create plan");
                Err(e)
            }
        };

        if let Some(worker_name) = event.payload_str("worker_name") {
            pool.report_submission(worker_name, &event, outcome).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "planning_pool_submissions"
    }
}

struct ClarificationHandler {
    pool: Weak<PlanningPool>,
}

#[async_trait]
impl EventHandler for ClarificationHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };

        let plan_id = event.payload_str("plan_id").and_then(|id| Uuid::parse_str(id).ok());
        let (Some(plan_id), Some(clarification_id), Some(response)) = (
            plan_id,
            event.payload_str("clarification_id"),
            event.payload_str("response"),
        ) else {
            error!(event_id = %event.id, "🧭 PLANNING: Malformed clarification response");
            return Ok(());
        };

        match pool.resume_with_clarification(plan_id, clarification_id, response).await {
            Ok(_) => {}
            Err(PoolError::PlanNotFound { .. }) => {
                warn!(plan_id = %plan_id, "🧭 PLANNING: Clarification for unknown plan");
            }
            Err(e @ PoolError::InvalidPlanState { .. })
            | Err(e @ PoolError::UnexpectedClarification { .. }) => {
                warn!(
                    plan_id = %plan_id,
                    error = %e,
                    "🧭 PLANNING: Ignoring clarification the plan is not waiting for"
                );
            }
            Err(e) => {
                warn!(
                    plan_id = %plan_id,
                    error = %e,
                    "🧭 PLANNING: Resumed plan failed, closing it out"
                );
                if let Err(e) = pool.aggregate(plan_id).await {
                    debug!(plan_id = %plan_id, error = %e, "Failed plan already closed");
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "planning_pool_clarifications"
    }
}
