//! The orchestration engine
//!
//! [`OrchestrationEngine`] drives plan executions: it instantiates plan nodes
//! as node executions, hands them to their steps, waits on correlation ids,
//! consults advisers at each decision point, and applies interrupts, timeouts
//! and barriers.
//!
//! Every node execution mutation is a compare-and-swap on the repository
//! version, retried a bounded number of times. Terminal statuses are sticky,
//! so a late duplicate signal never undoes a decision.
//!
//! # Usage
//!
//! ```ignore
//! let engine = OrchestrationEngine::builder()
//!     .with_sync_step("ECHO", |_ambiance, params| Ok(StepResponse::success(params.clone())))
//!     .build();
//!
//! let plan = PlanBuilder::new("deploy").starting_node("echo").add_node("echo", "ECHO").build();
//! let plan_execution_id = engine.start_plan(plan, HashMap::new()).await?;
//! let status = engine.wait_for_plan(&plan_execution_id).await?;
//! ```

mod advise;
mod interrupts;
mod runner;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adviser::{Adviser, AdviserRegistry};
use crate::ambiance::Ambiance;
use crate::barrier::BarrierEngine;
use crate::config::EngineConfig;
use crate::dispatch::{NullTaskDispatcher, TaskDispatcher};
use crate::error::{EngineError, Result};
use crate::events::{EventSink, NullEventSink, OrchestrationEvent};
use crate::execution::{
    ExecutableResponse, ExecutionMode, FailureInfo, InMemoryNodeExecutionRepository,
    InMemoryPlanExecutionRepository, NodeExecution, NodeExecutionRepository, PlanExecution,
    PlanExecutionRepository, Status, StepResponse,
};
use crate::facilitator::{Facilitator, FacilitatorRegistry, ModeFacilitator};
use crate::interrupt::{InMemoryInterruptRepository, Interrupt, InterruptRepository};
use crate::plan::{validate_plan, Plan, PlanMetadata, PlanRegistries, PlanStore, ValidationReport};
use crate::step::{Step, StepRegistry};
use crate::timeout::{TimeoutEngine, TimeoutTracker, TimeoutTrackerRegistry};
use crate::waiter::{CorrelationIndex, NotifyOutcome, Routed, WaitRegistry};

use runner::Placement;

/// Issuer recorded on interrupts raised by expired timeouts.
pub const TIMEOUT_ISSUER: &str = "timeout-sweeper";

/// Volatile per-execution state: timers, barriers and correlation waits.
struct RuntimeState {
    timeouts: TimeoutEngine,
    barriers: BarrierEngine,
    waits: WaitRegistry,
}

struct PlanRuntime {
    plan: Arc<Plan>,
    state: Mutex<RuntimeState>,
    /// Final plan status, published once.
    done: watch::Sender<Option<Status>>,
}

struct EngineInner {
    config: EngineConfig,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    timeout_trackers: TimeoutTrackerRegistry,
    steps: StepRegistry,
    nodes: Arc<dyn NodeExecutionRepository>,
    plan_executions: Arc<dyn PlanExecutionRepository>,
    interrupts: Arc<dyn InterruptRepository>,
    dispatcher: Arc<dyn TaskDispatcher>,
    events: Arc<dyn EventSink>,
    plans: RwLock<PlanStore>,
    runtimes: RwLock<HashMap<String, Arc<PlanRuntime>>>,
    /// Correlation id -> plan execution id, plus responses that beat their wait.
    correlations: Mutex<CorrelationIndex>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
}

impl OrchestrationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn registries(&self) -> PlanRegistries<'_> {
        PlanRegistries {
            facilitators: &self.inner.facilitators,
            advisers: &self.inner.advisers,
            timeout_trackers: &self.inner.timeout_trackers,
        }
    }

    /// Validate a plan against this engine's facilitators, advisers and
    /// timeout trackers.
    pub fn validate_plan(&self, plan: &Plan) -> ValidationReport {
        let report = validate_plan(plan, Some(&self.registries()));
        for step_type in plan
            .nodes
            .iter()
            .map(|n| n.step_type.as_str())
            .filter(|t| self.inner.facilitators.is_ambiguous(t))
        {
            log::warn!(
                "Step type '{}' in plan '{}' is claimed by several facilitators: {:?}",
                step_type,
                plan.id,
                self.inner.facilitators.facilitators_for(step_type)
            );
        }
        report
    }

    /// Validate and store a plan for later [`start_registered_plan`](Self::start_registered_plan) calls.
    pub fn register_plan(&self, plan: Plan) -> Result<()> {
        self.validate_plan(&plan).into_result()?;
        log::info!("Registered plan '{}' ({} nodes)", plan.id, plan.nodes.len());
        self.inner.plans.write().insert(plan)
    }

    pub fn registered_plans(&self) -> Vec<PlanMetadata> {
        self.inner.plans.read().list()
    }

    pub async fn start_registered_plan(
        &self,
        plan_id: &str,
        setup_abstractions: HashMap<String, String>,
    ) -> Result<String> {
        let plan = self
            .inner
            .plans
            .read()
            .get(plan_id)
            .cloned()
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;
        self.start_plan(plan, setup_abstractions).await
    }

    /// Validate `plan`, create a plan execution and schedule its starting node.
    ///
    /// Returns the plan execution id. The plan runs in the background; use
    /// [`wait_for_plan`](Self::wait_for_plan) to await its final status.
    pub async fn start_plan(
        &self,
        plan: Plan,
        setup_abstractions: HashMap<String, String>,
    ) -> Result<String> {
        self.validate_plan(&plan).into_result()?;
        let plan = Arc::new(plan);

        let plan_execution = PlanExecution::new(
            uuid::Uuid::new_v4().to_string(),
            &plan.id,
            setup_abstractions.clone(),
            self.inner.config.retention(),
        );
        let plan_execution = self.inner.plan_executions.insert(plan_execution).await?;
        let plan_execution_id = plan_execution.id;

        let (done, _) = watch::channel(None);
        let runtime = Arc::new(PlanRuntime {
            plan: Arc::clone(&plan),
            state: Mutex::new(RuntimeState {
                timeouts: TimeoutEngine::new(),
                barriers: BarrierEngine::from_plan(&plan),
                waits: WaitRegistry::new(),
            }),
            done,
        });
        self.inner
            .runtimes
            .write()
            .insert(plan_execution_id.clone(), Arc::clone(&runtime));

        log::info!(
            "Starting plan '{}' as execution '{}'",
            plan.id,
            plan_execution_id
        );
        self.emit(OrchestrationEvent::plan_status_changed(
            &plan_execution_id,
            Status::Queued,
            Status::Running,
        ));

        let ambiance = Ambiance::new(&plan_execution_id, &plan.id, setup_abstractions);
        self.approach_barriers(&runtime, &plan.starting_node_id);
        self.schedule(
            &plan_execution_id,
            &plan.starting_node_id,
            Placement::root(ambiance),
        )
        .await?;
        Ok(plan_execution_id)
    }

    /// Post a response for a correlation id.
    ///
    /// The owning node resumes in the background once its whole wait group
    /// has answered. Duplicates and late arrivals are reported, never applied.
    /// A response for an id nobody waits on yet is buffered and delivered
    /// when the wait is registered.
    pub async fn notify(&self, correlation_id: &str, response: Value) -> Result<NotifyOutcome> {
        let routed = self
            .inner
            .correlations
            .lock()
            .route(correlation_id, response, Utc::now());
        let (plan_execution_id, response) = match routed {
            Routed::Owned {
                plan_execution_id,
                response,
            } => (plan_execution_id, response),
            Routed::Buffered => {
                log::debug!("Buffered response for unregistered id '{}'", correlation_id);
                return Ok(NotifyOutcome::Buffered);
            }
            Routed::Duplicate => return Ok(NotifyOutcome::Duplicate),
            Routed::Dropped => {
                log::warn!("No wait registered for correlation id '{}'", correlation_id);
                return Ok(NotifyOutcome::Unknown);
            }
        };
        let Some(runtime) = self.find_runtime(&plan_execution_id) else {
            return Ok(NotifyOutcome::Unknown);
        };

        let outcome = runtime.state.lock().waits.notify(correlation_id, response);
        if let NotifyOutcome::Ready {
            node_execution_id,
            responses,
        } = &outcome
        {
            self.spawn_resume(node_execution_id.clone(), responses.clone());
        }
        Ok(outcome)
    }

    /// Report progress on a node; pushes out its ACTIVE timeouts.
    pub async fn record_activity(&self, node_execution_id: &str, at: DateTime<Utc>) -> Result<()> {
        let node = self.inner.nodes.get(node_execution_id).await?;
        if let Some(runtime) = self.find_runtime(&node.plan_execution_id) {
            runtime.state.lock().timeouts.on_activity(node_execution_id, at);
        }
        Ok(())
    }

    /// Expire every timeout past its deadline at `now` and raise its
    /// interrupt. Returns the number of timeouts that fired.
    ///
    /// Also drops buffered responses older than the configured TTL.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            .checked_sub_signed(self.inner.config.buffered_response_ttl())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let dropped = self.inner.correlations.lock().prune(cutoff);
        if dropped > 0 {
            log::debug!("Dropped {} unclaimed buffered response(s)", dropped);
        }

        let runtimes: Vec<(String, Arc<PlanRuntime>)> = self
            .inner
            .runtimes
            .read()
            .iter()
            .map(|(id, runtime)| (id.clone(), Arc::clone(runtime)))
            .collect();

        let mut fired = 0;
        for (plan_execution_id, runtime) in runtimes {
            let expired = runtime.state.lock().timeouts.sweep(now);
            for timeout in expired {
                log::info!(
                    "Timeout '{}' expired for node '{}'; raising {}",
                    timeout.instance_id,
                    timeout.node_execution_id,
                    timeout.on_expiry
                );
                let interrupt = Interrupt::new(timeout.on_expiry, &plan_execution_id)
                    .for_node(&timeout.node_execution_id)
                    .issued_by(TIMEOUT_ISSUER)
                    .with_failure(FailureInfo::expired());
                if let Err(e) = self.interrupt(interrupt).await {
                    log::error!(
                        "Failed to apply timeout interrupt to '{}': {}",
                        timeout.node_execution_id,
                        e
                    );
                }
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Run [`sweep_timeouts`](Self::sweep_timeouts) on the configured
    /// interval until the returned handle is aborted.
    pub fn spawn_timeout_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.inner.config.timeout_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_timeouts(Utc::now()).await {
                    log::error!("Timeout sweep failed: {}", e);
                }
            }
        })
    }

    /// Wait until the plan execution reaches a terminal status.
    pub async fn wait_for_plan(&self, plan_execution_id: &str) -> Result<Status> {
        let Some(runtime) = self.find_runtime(plan_execution_id) else {
            return Ok(self.inner.plan_executions.get(plan_execution_id).await?.status);
        };

        let mut receiver = runtime.done.subscribe();
        loop {
            let current = *receiver.borrow_and_update();
            if let Some(status) = current {
                return Ok(status);
            }
            if receiver.changed().await.is_err() {
                break;
            }
        }
        Ok(self.inner.plan_executions.get(plan_execution_id).await?.status)
    }

    /// Error out every non-terminal node of the execution and finish it as
    /// ERRORED. Returns the number of nodes that were errored.
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> Result<usize> {
        let failure = FailureInfo::new(
            "Plan execution errored out",
            crate::execution::FailureType::Unknown,
        );
        let mut errored = 0;
        for node in self
            .inner
            .nodes
            .find_by_plan_execution(plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| !n.is_terminal())
        {
            let (node, changed) = self
                .update_node(&node.id, |n| {
                    if n.is_terminal() {
                        return Ok(false);
                    }
                    n.failure_info = Some(failure.clone());
                    n.transition(Status::Errored)
                })
                .await?;
            if changed {
                self.release_node_resources(&node).await;
                errored += 1;
            }
        }
        log::warn!(
            "Errored out {} node(s) of plan execution '{}'",
            errored,
            plan_execution_id
        );
        self.finish_plan(plan_execution_id, Status::Errored).await?;
        Ok(errored)
    }

    /// Delete terminal plan executions whose retention window has elapsed,
    /// together with their node executions. Returns the purged ids.
    pub async fn purge_expired_plan_executions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .inner
            .plan_executions
            .list()
            .await?
            .into_iter()
            .filter(|pe| pe.is_expired(now))
            .map(|pe| pe.id)
            .collect();

        for id in &expired {
            let removed = self.inner.nodes.delete_by_plan_execution(id).await?;
            self.inner.plan_executions.delete(id).await?;
            self.release_runtime(id);
            log::info!(
                "Purged plan execution '{}' with {} node execution(s)",
                id,
                removed
            );
        }
        Ok(expired)
    }

    pub async fn node_execution(&self, node_execution_id: &str) -> Result<NodeExecution> {
        self.inner.nodes.get(node_execution_id).await
    }

    /// Node executions of a plan execution in creation order.
    pub async fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.inner.nodes.find_by_plan_execution(plan_execution_id).await
    }

    pub async fn plan_execution(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        self.inner.plan_executions.get(plan_execution_id).await
    }

    // ========================================================================
    // Internals shared by the submodules
    // ========================================================================

    fn find_runtime(&self, plan_execution_id: &str) -> Option<Arc<PlanRuntime>> {
        self.inner.runtimes.read().get(plan_execution_id).cloned()
    }

    fn runtime(&self, plan_execution_id: &str) -> Result<Arc<PlanRuntime>> {
        self.find_runtime(plan_execution_id)
            .ok_or_else(|| EngineError::PlanExecutionNotFound(plan_execution_id.to_string()))
    }

    /// Drop the volatile state of a finished execution and its correlation ids.
    fn release_runtime(&self, plan_execution_id: &str) {
        self.inner.runtimes.write().remove(plan_execution_id);
        self.inner.correlations.lock().release(plan_execution_id);
    }

    fn emit(&self, event: OrchestrationEvent) {
        if let Err(e) = self.inner.events.send(event) {
            log::warn!("Dropping orchestration event: {}", e);
        }
    }

    /// Mark the forcers of every barrier in the branch rooted at `root_id`
    /// as approaching.
    fn approach_barriers(&self, runtime: &PlanRuntime, root_id: &str) {
        let participants: Vec<String> = runtime
            .plan
            .barriers_in_branch(root_id)
            .into_iter()
            .map(|b| b.id.clone())
            .collect();
        if participants.is_empty() {
            return;
        }
        let mut state = runtime.state.lock();
        for participant in &participants {
            state.barriers.approach(participant);
        }
    }

    /// Read-modify-write a node execution with optimistic concurrency.
    ///
    /// `mutate` runs against a fresh copy on every attempt and must be
    /// repeatable. Nothing is written when it leaves the node unchanged.
    async fn update_node<T, F>(&self, node_execution_id: &str, mut mutate: F) -> Result<(NodeExecution, T)>
    where
        F: FnMut(&mut NodeExecution) -> Result<T> + Send,
        T: Send,
    {
        let attempts = self.inner.config.max_update_attempts();
        for attempt in 1..=attempts {
            let mut node = self.inner.nodes.get(node_execution_id).await?;
            let original = node.clone();
            let value = mutate(&mut node)?;
            if node == original {
                return Ok((node, value));
            }

            match self.inner.nodes.update(node).await {
                Ok(updated) => {
                    if updated.status != original.status {
                        log::debug!(
                            "Node '{}' ({}) {} -> {}",
                            updated.identifier,
                            updated.id,
                            original.status,
                            updated.status
                        );
                        self.emit(OrchestrationEvent::node_status_changed(
                            &updated.plan_execution_id,
                            &updated.id,
                            original.status,
                            updated.status,
                        ));
                    }
                    return Ok((updated, value));
                }
                Err(EngineError::VersionConflict { .. }) => {
                    log::debug!(
                        "Version conflict on node '{}' (attempt {}/{})",
                        node_execution_id,
                        attempt,
                        attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ConflictRetriesExhausted(
            node_execution_id.to_string(),
        ))
    }

    async fn update_plan_execution<T, F>(
        &self,
        plan_execution_id: &str,
        mut mutate: F,
    ) -> Result<(PlanExecution, T)>
    where
        F: FnMut(&mut PlanExecution) -> Result<T> + Send,
        T: Send,
    {
        let attempts = self.inner.config.max_update_attempts();
        for _ in 0..attempts {
            let mut plan_execution = self.inner.plan_executions.get(plan_execution_id).await?;
            let original = plan_execution.clone();
            let value = mutate(&mut plan_execution)?;
            if plan_execution == original {
                return Ok((plan_execution, value));
            }

            match self.inner.plan_executions.update(plan_execution).await {
                Ok(updated) => {
                    if updated.status != original.status {
                        self.emit(OrchestrationEvent::plan_status_changed(
                            &updated.id,
                            original.status,
                            updated.status,
                        ));
                    }
                    return Ok((updated, value));
                }
                Err(EngineError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ConflictRetriesExhausted(
            plan_execution_id.to_string(),
        ))
    }

    /// Run `task` for a node in the background. An error errors the node.
    fn spawn_for_node<Fut>(&self, node_execution_id: String, task: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                engine.fail_node(&node_execution_id, e).await;
            }
        });
    }
}

/// Builder for [`OrchestrationEngine`].
///
/// Defaults to the built-in facilitators, advisers and timeout trackers,
/// in-memory repositories, and sinks that drop events and tasks.
pub struct EngineBuilder {
    config: EngineConfig,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    timeout_trackers: TimeoutTrackerRegistry,
    steps: StepRegistry,
    nodes: Arc<dyn NodeExecutionRepository>,
    plan_executions: Arc<dyn PlanExecutionRepository>,
    interrupts: Arc<dyn InterruptRepository>,
    dispatcher: Arc<dyn TaskDispatcher>,
    events: Arc<dyn EventSink>,
    plans: PlanStore,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            facilitators: FacilitatorRegistry::with_builtins(),
            advisers: AdviserRegistry::with_builtins(),
            timeout_trackers: TimeoutTrackerRegistry::with_builtins(),
            steps: StepRegistry::new(),
            nodes: Arc::new(InMemoryNodeExecutionRepository::new()),
            plan_executions: Arc::new(InMemoryPlanExecutionRepository::new()),
            interrupts: Arc::new(InMemoryInterruptRepository::new()),
            dispatcher: Arc::new(NullTaskDispatcher),
            events: Arc::new(NullEventSink),
            plans: PlanStore::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a step together with a facilitator that always selects `mode`.
    pub fn with_step(
        mut self,
        step_type: impl Into<String>,
        mode: ExecutionMode,
        step: Arc<dyn Step>,
    ) -> Self {
        let step_type = step_type.into();
        self.facilitators
            .register(step_type.clone(), Arc::new(ModeFacilitator::for_mode(mode)));
        self.steps.register(step_type, step);
        self
    }

    /// Register a synchronous closure as a SYNC step.
    pub fn with_sync_step(
        mut self,
        step_type: impl Into<String>,
        callback: impl Fn(&Ambiance, &Value) -> Result<StepResponse> + Send + Sync + 'static,
    ) -> Self {
        let step_type = step_type.into();
        self.facilitators.register(
            step_type.clone(),
            Arc::new(ModeFacilitator::for_mode(ExecutionMode::Sync)),
        );
        self.steps.register_sync(step_type, callback);
        self
    }

    /// Register an async closure as a step running in `mode`.
    pub fn with_callback_step<F, Fut>(
        mut self,
        step_type: impl Into<String>,
        mode: ExecutionMode,
        callback: F,
    ) -> Self
    where
        F: Fn(Ambiance, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutableResponse>> + Send + 'static,
    {
        let step_type = step_type.into();
        self.facilitators
            .register(step_type.clone(), Arc::new(ModeFacilitator::for_mode(mode)));
        self.steps.register_callback(step_type, callback);
        self
    }

    pub fn with_facilitator(
        mut self,
        step_type: impl Into<String>,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        self.facilitators.register(step_type, facilitator);
        self
    }

    pub fn with_adviser(mut self, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.register(adviser);
        self
    }

    pub fn with_timeout_tracker<F>(mut self, tracker_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<dyn TimeoutTracker>> + Send + Sync + 'static,
    {
        self.timeout_trackers.register(tracker_type, factory);
        self
    }

    pub fn with_node_repository(mut self, nodes: Arc<dyn NodeExecutionRepository>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_plan_execution_repository(
        mut self,
        plan_executions: Arc<dyn PlanExecutionRepository>,
    ) -> Self {
        self.plan_executions = plan_executions;
        self
    }

    pub fn with_interrupt_repository(mut self, interrupts: Arc<dyn InterruptRepository>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_plan_store(mut self, plans: PlanStore) -> Self {
        self.plans = plans;
        self
    }

    pub fn build(mut self) -> OrchestrationEngine {
        self.facilitators
            .set_precedence(self.config.facilitator_precedence.clone());
        let correlations = CorrelationIndex::new(self.config.max_buffered_responses);
        OrchestrationEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                facilitators: self.facilitators,
                advisers: self.advisers,
                timeout_trackers: self.timeout_trackers,
                steps: self.steps,
                nodes: self.nodes,
                plan_executions: self.plan_executions,
                interrupts: self.interrupts,
                dispatcher: self.dispatcher,
                events: self.events,
                plans: RwLock::new(self.plans),
                runtimes: RwLock::new(HashMap::new()),
                correlations: Mutex::new(correlations),
            }),
        }
    }
}
