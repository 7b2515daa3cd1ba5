//! Scheduling and running node executions up to their decision point.

use std::time::Duration;

use chrono::Utc;

use super::{OrchestrationEngine, PlanRuntime};
use crate::ambiance::{Ambiance, Level};
use crate::dispatch::TaskRequest;
use crate::error::{EngineError, Result};
use crate::execution::{
    ChildrenMode, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, NodeExecution,
    ResponseMap, Status, StepResponse,
};
use crate::interrupt::InterruptType;
use crate::plan::PlanNode;
use crate::waiter::NotifyOutcome;

/// Where a new node execution sits relative to the ones already running.
pub(super) struct Placement {
    /// Ambiance the new node's level is pushed onto.
    ambiance: Ambiance,
    parent_id: Option<String>,
    branch_id: Option<String>,
    previous_id: Option<String>,
    retry_count: u32,
    retry_ids: Vec<String>,
    delay: Option<Duration>,
}

impl Placement {
    pub(super) fn root(ambiance: Ambiance) -> Self {
        Self {
            ambiance,
            parent_id: None,
            branch_id: None,
            previous_id: None,
            retry_count: 0,
            retry_ids: Vec::new(),
            delay: None,
        }
    }

    /// Next node in the same branch as `node`.
    pub(super) fn after(node: &NodeExecution) -> Self {
        Self {
            ambiance: node.ambiance.pop_level(),
            parent_id: node.parent_id.clone(),
            branch_id: node.branch_id.clone(),
            previous_id: Some(node.id.clone()),
            retry_count: 0,
            retry_ids: Vec::new(),
            delay: None,
        }
    }

    /// Root of the child branch `branch_id` under `parent`.
    pub(super) fn child_of(parent: &NodeExecution, branch_id: &str) -> Self {
        Self {
            ambiance: parent.ambiance.clone(),
            parent_id: Some(parent.id.clone()),
            branch_id: Some(branch_id.to_string()),
            previous_id: None,
            retry_count: 0,
            retry_ids: Vec::new(),
            delay: None,
        }
    }

    /// Fresh execution of the same plan node, started after `delay`.
    pub(super) fn retry_of(node: &NodeExecution, delay: Duration) -> Self {
        let mut retry_ids = node.retry_ids.clone();
        retry_ids.push(node.id.clone());
        Self {
            retry_count: node.retry_count + 1,
            retry_ids,
            delay: (!delay.is_zero()).then_some(delay),
            previous_id: node.previous_id.clone(),
            ..Self::after(node)
        }
    }
}

/// Failure response for an error raised by step code.
pub(super) fn step_failure(error: &EngineError, failure_type: FailureType) -> StepResponse {
    StepResponse::failure(FailureInfo::new(error.to_string(), failure_type))
}

impl OrchestrationEngine {
    /// Create a QUEUED node execution for `plan_node_id` and launch it.
    ///
    /// Returns `None` when the plan execution has already finished.
    pub(super) async fn schedule(
        &self,
        plan_execution_id: &str,
        plan_node_id: &str,
        placement: Placement,
    ) -> Result<Option<String>> {
        let Some(runtime) = self.find_runtime(plan_execution_id) else {
            log::debug!(
                "Not scheduling '{}': plan execution '{}' was released",
                plan_node_id,
                plan_execution_id
            );
            return Ok(None);
        };
        let plan_node = runtime.plan.fetch_node(plan_node_id)?;
        let limit = self.inner.config.max_node_executions_per_plan;

        let (_, admitted) = self
            .update_plan_execution(plan_execution_id, |pe| {
                if pe.is_terminal() {
                    return Ok(Some(false));
                }
                if pe.node_execution_count >= limit {
                    return Ok(None);
                }
                pe.node_execution_count += 1;
                Ok(Some(true))
            })
            .await?;
        match admitted {
            Some(true) => {}
            Some(false) => {
                log::debug!(
                    "Not scheduling '{}': plan execution '{}' has finished",
                    plan_node_id,
                    plan_execution_id
                );
                return Ok(None);
            }
            None => {
                log::error!(
                    "Plan execution '{}' exceeded {} node executions",
                    plan_execution_id,
                    limit
                );
                self.error_out_active_nodes(plan_execution_id).await?;
                return Err(EngineError::ExecutionLimitExceeded {
                    plan_execution_id: plan_execution_id.to_string(),
                    limit,
                });
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut level = Level::new(
            &plan_node.id,
            &id,
            &plan_node.identifier,
            &plan_node.step_type,
        )
        .with_start_ts(Utc::now().timestamp_millis())
        .with_retry_index(placement.retry_count);
        if let Some(group) = &plan_node.group {
            level = level.with_group(group.clone());
        }

        let mut node = NodeExecution::new(
            &id,
            plan_execution_id,
            &plan_node.id,
            &plan_node.identifier,
            &plan_node.step_type,
            placement.ambiance.push_level(level),
        );
        node.parent_id = placement.parent_id;
        node.branch_id = placement.branch_id;
        node.previous_id = placement.previous_id;
        node.retry_count = placement.retry_count;
        node.retry_ids = placement.retry_ids;
        self.inner.nodes.insert(node).await?;

        log::debug!(
            "Scheduled node '{}' ({}) as '{}'",
            plan_node.identifier,
            plan_node.step_type,
            id
        );
        self.launch(id.clone(), placement.delay);
        Ok(Some(id))
    }

    fn launch(&self, node_execution_id: String, delay: Option<Duration>) {
        let engine = self.clone();
        let id = node_execution_id.clone();
        self.spawn_for_node(node_execution_id, async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            engine.start_node(&id).await
        });
    }

    pub(super) fn spawn_resume(&self, node_execution_id: String, responses: ResponseMap) {
        let engine = self.clone();
        let id = node_execution_id.clone();
        self.spawn_for_node(node_execution_id, async move {
            engine.resume_node(&id, responses).await
        });
    }

    async fn start_node(&self, node_execution_id: &str) -> Result<()> {
        let node = self.inner.nodes.get(node_execution_id).await?;
        if node.status != Status::Queued {
            return Ok(());
        }

        if let Some(parent_id) = &node.parent_id {
            let parent = self.inner.nodes.get(parent_id).await?;
            if matches!(parent.status, Status::Discontinuing | Status::Aborted) {
                log::debug!("Parent of '{}' was aborted; aborting it", node.id);
                let (node, aborted) = self
                    .update_node(node_execution_id, |n| n.transition(Status::Aborted))
                    .await?;
                if aborted {
                    self.branch_finished(&node).await?;
                }
                return Ok(());
            }
        }

        let plan_execution = self.inner.plan_executions.get(&node.plan_execution_id).await?;
        if plan_execution.is_terminal() {
            return Ok(());
        }
        if plan_execution.pause_requested {
            log::info!("Plan execution paused; holding node '{}'", node.identifier);
            self.update_node(node_execution_id, |n| n.pause()).await?;
            return Ok(());
        }
        self.begin(node_execution_id).await
    }

    /// Move a QUEUED (or held) node to RUNNING and execute its step.
    pub(super) async fn begin(&self, node_execution_id: &str) -> Result<()> {
        let node = self.inner.nodes.get(node_execution_id).await?;
        let Some(runtime) = self.find_runtime(&node.plan_execution_id) else {
            return Ok(());
        };
        let plan_node = runtime.plan.fetch_node(&node.plan_node_id)?;

        if let Some(condition) = &plan_node.skip_condition {
            if condition.evaluate(&node.ambiance) {
                log::info!("Skipping node '{}'", plan_node.identifier);
                return self
                    .finish_and_continue(&node, Status::Skipped, plan_node.next_node_id.clone())
                    .await;
            }
        }

        let (node, started) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                n.paused_from = None;
                n.transition(Status::Running)
            })
            .await?;
        if !started {
            return Ok(());
        }

        let now = Utc::now();
        for obtainment in &plan_node.timeout_obtainments {
            let tracker = self
                .inner
                .timeout_trackers
                .create(&obtainment.kind, &obtainment.parameters)?;
            runtime.state.lock().timeouts.register(
                &node.id,
                tracker,
                InterruptType::MarkExpired,
                now,
            );
        }

        self.execute(&runtime, &node, plan_node).await
    }

    async fn execute(
        &self,
        runtime: &PlanRuntime,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> Result<()> {
        let facilitation = self.inner.facilitators.facilitate(
            &node.step_type,
            &node.ambiance,
            &plan_node.step_parameters,
        )?;
        let initial_wait = facilitation.initial_wait();
        if !initial_wait.is_zero() {
            tokio::time::sleep(initial_wait).await;
        }

        let mode = facilitation.execution_mode;
        let (node, _) = self
            .update_node(&node.id, |n| {
                if !n.is_terminal() {
                    n.mode = Some(mode);
                }
                Ok(())
            })
            .await?;
        if node.is_terminal() {
            return Ok(());
        }

        if mode == ExecutionMode::Barrier {
            return self.arrive_at_barrier(runtime, &node).await;
        }

        let step = self.inner.steps.get(&node.step_type)?;
        let response = match step.start(&node.ambiance, &plan_node.step_parameters).await {
            Ok(response) => response,
            Err(e) if e.is_integrity_error() => return Err(e),
            Err(e) => {
                log::warn!("Step '{}' failed to start: {}", node.identifier, e);
                ExecutableResponse::Sync(step_failure(&e, FailureType::ApplicationError))
            }
        };
        if !response.fits_mode(mode) {
            return Err(EngineError::ModeMismatch {
                step_type: node.step_type.clone(),
                expected: mode.as_str().to_string(),
                actual: response.mode().as_str().to_string(),
            });
        }
        self.handle_executable(&node.id, response).await
    }

    /// Act on what a step handed back.
    pub(super) async fn handle_executable(
        &self,
        node_execution_id: &str,
        response: ExecutableResponse,
    ) -> Result<()> {
        let recorded = response.clone();
        match response {
            ExecutableResponse::Sync(step_response) => {
                let (_, kept) = self
                    .update_node(node_execution_id, |n| {
                        if n.is_terminal() {
                            return Ok(false);
                        }
                        n.executable_responses.push(recorded.clone());
                        Ok(true)
                    })
                    .await?;
                if !kept {
                    log::debug!(
                        "Node '{}' finished while its step ran; dropping the response",
                        node_execution_id
                    );
                    return Ok(());
                }
                self.decide(node_execution_id, step_response, None).await
            }
            ExecutableResponse::Async { callback_ids } => {
                let (node, waiting) = self
                    .record_and_wait(node_execution_id, &recorded, Status::AsyncWaiting)
                    .await?;
                if waiting {
                    self.register_wait(&node, &callback_ids)?;
                }
                Ok(())
            }
            ExecutableResponse::Task {
                task_id,
                task_identifier,
                payload,
            }
            | ExecutableResponse::TaskChain {
                task_id,
                task_identifier,
                payload,
                ..
            } => {
                let (node, waiting) = self
                    .record_and_wait(node_execution_id, &recorded, Status::TaskWaiting)
                    .await?;
                if !waiting {
                    return Ok(());
                }
                self.register_wait(&node, std::slice::from_ref(&task_id))?;

                let request = TaskRequest {
                    task_id: task_id.clone(),
                    task_identifier,
                    payload,
                    abstractions: node.ambiance.setup_abstractions().clone(),
                    callback_id: task_id,
                    plan_execution_id: node.plan_execution_id.clone(),
                    node_execution_id: node.id.clone(),
                };
                if let Err(e) = self.inner.dispatcher.dispatch(request).await {
                    log::warn!("Could not dispatch task for '{}': {}", node.identifier, e);
                    let runtime = self.runtime(&node.plan_execution_id)?;
                    runtime.state.lock().waits.cancel_for_node(&node.id);
                    return self
                        .decide(
                            &node.id,
                            step_failure(&e, FailureType::NoEligibleDelegate),
                            None,
                        )
                        .await;
                }
                Ok(())
            }
            ExecutableResponse::Child { child_node_id } => {
                self.fan_out(
                    node_execution_id,
                    &recorded,
                    vec![child_node_id],
                    ChildrenMode::All,
                )
                .await
            }
            ExecutableResponse::Children {
                child_node_ids,
                mode,
            } => {
                self.fan_out(node_execution_id, &recorded, child_node_ids, mode)
                    .await
            }
        }
    }

    async fn record_and_wait(
        &self,
        node_execution_id: &str,
        recorded: &ExecutableResponse,
        waiting: Status,
    ) -> Result<(NodeExecution, bool)> {
        self.update_node(node_execution_id, |n| {
            if n.is_terminal() {
                return Ok(false);
            }
            n.executable_responses.push(recorded.clone());
            n.enter_wait(waiting)
        })
        .await
    }

    /// Register the node's wait group, then claim any responses that arrived
    /// before it. The group exists before the ids are bound, so a response
    /// racing this call either lands in the group or in the buffer drained here.
    fn register_wait(&self, node: &NodeExecution, callback_ids: &[String]) -> Result<()> {
        let runtime = self.runtime(&node.plan_execution_id)?;
        runtime.state.lock().waits.register(&node.id, callback_ids);
        let early = self
            .inner
            .correlations
            .lock()
            .bind(&node.plan_execution_id, callback_ids);
        if early.is_empty() {
            return Ok(());
        }

        log::debug!(
            "Node '{}' claims {} early response(s)",
            node.identifier,
            early.len()
        );
        let mut state = runtime.state.lock();
        for (callback_id, response) in early {
            if let NotifyOutcome::Ready {
                node_execution_id,
                responses,
            } = state.waits.notify(&callback_id, response)
            {
                self.spawn_resume(node_execution_id, responses);
            }
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        node_execution_id: &str,
        recorded: &ExecutableResponse,
        child_node_ids: Vec<String>,
        mode: ChildrenMode,
    ) -> Result<()> {
        let (parent, running) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                n.executable_responses.push(recorded.clone());
                Ok(true)
            })
            .await?;
        if !running {
            return Ok(());
        }

        let runtime = self.runtime(&parent.plan_execution_id)?;
        for child in &child_node_ids {
            runtime.plan.fetch_node(child)?;
        }
        for child in &child_node_ids {
            self.approach_barriers(&runtime, child);
            self.schedule(
                &parent.plan_execution_id,
                child,
                Placement::child_of(&parent, child),
            )
            .await?;
        }

        // Nothing to wait for: no children, or a MIN(0) fan-out.
        if mode.required(child_node_ids.len()) == 0 {
            log::debug!(
                "Node '{}' needs none of its {} children",
                parent.identifier,
                child_node_ids.len()
            );
            self.release_parent(&parent.id).await?;
        }
        Ok(())
    }

    async fn arrive_at_barrier(&self, runtime: &PlanRuntime, node: &NodeExecution) -> Result<()> {
        let (node, waiting) = self
            .update_node(&node.id, |n| n.enter_wait(Status::AsyncWaiting))
            .await?;
        if !waiting {
            return Ok(());
        }
        let outcome = runtime
            .state
            .lock()
            .barriers
            .arrive(&node.plan_node_id, &node.id);
        self.handle_barrier_outcome(&node.plan_execution_id, outcome);
        Ok(())
    }

    /// Resume a waiting node with the responses of its wait group.
    pub(super) async fn resume_node(
        &self,
        node_execution_id: &str,
        responses: ResponseMap,
    ) -> Result<()> {
        let (node, resumed) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                if n.status == Status::Paused {
                    n.pending_responses.extend(responses.clone());
                    return Ok(false);
                }
                if n.status.is_waiting() {
                    n.transition(Status::Running)?;
                }
                Ok(true)
            })
            .await?;
        if !resumed {
            log::debug!("Node '{}' not resumable right now", node.identifier);
            return Ok(());
        }

        let runtime = self.runtime(&node.plan_execution_id)?;
        let plan_node = runtime.plan.fetch_node(&node.plan_node_id)?;
        let step = self.inner.steps.get(&node.step_type)?;

        match node.executable_responses.last() {
            Some(ExecutableResponse::TaskChain {
                chain_end: false,
                pass_through,
                ..
            }) => {
                let next = match step
                    .next_link(
                        &node.ambiance,
                        &plan_node.step_parameters,
                        pass_through,
                        &responses,
                    )
                    .await
                {
                    Ok(next) => next,
                    Err(e) if e.is_integrity_error() => return Err(e),
                    Err(e) => {
                        ExecutableResponse::Sync(step_failure(&e, FailureType::ApplicationError))
                    }
                };
                if !next.fits_mode(ExecutionMode::TaskChain) {
                    return Err(EngineError::ModeMismatch {
                        step_type: node.step_type.clone(),
                        expected: ExecutionMode::TaskChain.as_str().to_string(),
                        actual: next.mode().as_str().to_string(),
                    });
                }
                self.handle_executable(&node.id, next).await
            }
            _ => {
                let response = match step
                    .resume(&node.ambiance, &plan_node.step_parameters, &responses)
                    .await
                {
                    Ok(response) => response,
                    Err(e) if e.is_integrity_error() => return Err(e),
                    Err(e) => step_failure(&e, FailureType::ApplicationError),
                };
                self.decide(&node.id, response, None).await
            }
        }
    }

    /// Cancel everything the node is still waiting on: timeouts, correlation
    /// waits and dispatched tasks.
    pub(super) async fn release_node_resources(&self, node: &NodeExecution) {
        let Some(runtime) = self.find_runtime(&node.plan_execution_id) else {
            return;
        };
        let outstanding = {
            let mut state = runtime.state.lock();
            state.timeouts.stop_for_node(&node.id);
            state.waits.cancel_for_node(&node.id)
        };
        if outstanding.is_empty() {
            return;
        }

        let delegated = matches!(
            node.executable_responses.last(),
            Some(ExecutableResponse::Task { .. } | ExecutableResponse::TaskChain { .. })
        );
        if !delegated {
            return;
        }
        for task_id in node
            .awaited_callback_ids()
            .into_iter()
            .filter(|task_id| outstanding.contains(task_id))
        {
            if let Err(e) = self.inner.dispatcher.abort(&task_id).await {
                log::warn!("Failed to abort task '{}': {}", task_id, e);
            }
        }
    }

    /// An engine error escaped a node's background work: the node is ERRORED.
    pub(super) async fn fail_node(&self, node_execution_id: &str, error: EngineError) {
        log::error!("Node execution '{}' errored: {}", node_execution_id, error);
        if let Err(e) = self.error_node(node_execution_id, &error).await {
            log::error!(
                "Could not mark node execution '{}' as errored: {}",
                node_execution_id,
                e
            );
        }
    }

    async fn error_node(&self, node_execution_id: &str, error: &EngineError) -> Result<()> {
        let failure = FailureInfo::new(error.to_string(), FailureType::Unknown);
        let (node, errored) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                n.failure_info = Some(failure.clone());
                n.transition(Status::Errored)
            })
            .await?;
        if !errored {
            return Ok(());
        }
        self.release_node_resources(&node).await;
        self.branch_finished(&node).await
    }
}
