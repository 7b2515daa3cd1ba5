//! Decision point: recording outcomes, consulting advisers, applying advises,
//! and propagating branch and plan completion.

use chrono::Utc;
use serde_json::Value;

use super::runner::{step_failure, Placement};
use super::OrchestrationEngine;
use crate::adviser::{Advise, AdvisingEvent};
use crate::barrier::BarrierOutcome;
use crate::error::Result;
use crate::events::OrchestrationEvent;
use crate::execution::{
    ChildrenMode, ExecutableResponse, ExecutionMode, FailureInfo, FailureType, NodeExecution,
    Status, StepResponse,
};
use crate::interrupt::InterruptEffect;
use crate::plan::PlanNode;
use crate::timeout::{saturating_millis, AbsoluteTimeoutTracker};

/// Continuation used when no adviser speaks up.
pub(super) fn default_advise(outcome: Option<&StepResponse>, plan_node: &PlanNode) -> Advise {
    let succeeded = outcome.map_or(true, StepResponse::is_success);
    Advise::NextStep {
        next_node_id: if succeeded {
            plan_node.next_node_id.clone()
        } else {
            None
        },
    }
}

/// Final status of a node whose outcome is carried forward as-is.
fn outcome_status(node: &NodeExecution) -> Status {
    node.outcome
        .as_ref()
        .map(|o| o.status)
        .filter(|s| s.is_terminal())
        .unwrap_or(Status::Succeeded)
}

fn failed_status(node: &NodeExecution) -> Status {
    let status = outcome_status(node);
    if status.is_broken() {
        status
    } else {
        Status::Failed
    }
}

impl OrchestrationEngine {
    /// The step produced `response`: record it and act on the node's advise.
    ///
    /// A terminal node ignores the call. A paused node only records the
    /// outcome; the advise is applied when it resumes.
    pub(super) async fn decide(
        &self,
        node_execution_id: &str,
        response: StepResponse,
        effect: Option<InterruptEffect>,
    ) -> Result<()> {
        let (node, ready) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                if let Some(effect) = &effect {
                    if !n.has_interrupt(&effect.interrupt_id) {
                        n.interrupt_history.push(effect.clone());
                    }
                }
                if n.outcome.is_none() || effect.is_some() {
                    n.failure_info = response.failure_info.clone();
                    n.output = response.output.clone();
                    n.outcome = Some(response.clone());
                }
                Ok(n.status != Status::Paused)
            })
            .await?;
        if !ready {
            return Ok(());
        }
        self.conclude(&node).await
    }

    /// Stop the node's timers and waits, then claim and apply its advise.
    pub(super) async fn conclude(&self, node: &NodeExecution) -> Result<()> {
        self.release_node_resources(node).await;
        let advise = match &node.adviser_response {
            Some(advise) => advise.clone(),
            None => self.consult_advisers(node)?,
        };

        let (node, claimed) = self
            .update_node(&node.id, |n| {
                if n.advise_consumed || n.is_terminal() {
                    return Ok(false);
                }
                if n.adviser_response.is_none() {
                    n.adviser_response = Some(advise.clone());
                }
                n.advise_consumed = true;
                Ok(true)
            })
            .await?;
        if !claimed {
            log::debug!("Advise for '{}' already applied", node.id);
            return Ok(());
        }
        let advise = node.adviser_response.clone().unwrap_or(advise);
        self.apply_advise(&node, advise).await
    }

    fn consult_advisers(&self, node: &NodeExecution) -> Result<Advise> {
        let runtime = self.runtime(&node.plan_execution_id)?;
        let plan_node = runtime.plan.fetch_node(&node.plan_node_id)?;
        let outcome = node.outcome.as_ref();
        let status = outcome.map_or(Status::Succeeded, |o| o.status);

        let event = AdvisingEvent {
            node_execution_id: &node.id,
            plan_node_id: &node.plan_node_id,
            status,
            failure_info: outcome.and_then(|o| o.failure_info.as_ref()),
            retry_count: node.retry_count,
            next_node_id: plan_node.next_node_id.as_deref(),
            parameters: &Value::Null,
        };
        match self
            .inner
            .advisers
            .advise(&plan_node.adviser_obtainments, &event)?
        {
            Some((adviser_type, advise)) => {
                log::info!(
                    "Adviser '{}' chose {} for node '{}'",
                    adviser_type,
                    advise.name(),
                    node.identifier
                );
                Ok(advise)
            }
            None => Ok(default_advise(outcome, plan_node)),
        }
    }

    pub(super) async fn apply_advise(&self, node: &NodeExecution, advise: Advise) -> Result<()> {
        log::debug!(
            "Applying {} to node '{}' ({})",
            advise.name(),
            node.identifier,
            node.id
        );
        match advise {
            Advise::NextStep { next_node_id } => {
                let status = outcome_status(node);
                let next = next_node_id.filter(|_| !status.is_broken());
                self.finish_and_continue(node, status, next).await
            }
            Advise::Resume => {
                let runtime = self.runtime(&node.plan_execution_id)?;
                let plan_node = runtime.plan.fetch_node(&node.plan_node_id)?;
                let next = match default_advise(node.outcome.as_ref(), plan_node) {
                    Advise::NextStep { next_node_id } => next_node_id,
                    _ => None,
                };
                self.finish_and_continue(node, outcome_status(node), next)
                    .await
            }
            Advise::OnFail { next_node_id } => {
                self.finish_and_continue(node, failed_status(node), Some(next_node_id))
                    .await
            }
            Advise::Rollback { rollback_node_id } => {
                self.finish_and_continue(node, failed_status(node), Some(rollback_node_id))
                    .await
            }
            Advise::Ignore { next_node_id } => {
                self.finish_and_continue(node, Status::IgnoreFailed, next_node_id)
                    .await
            }
            Advise::MarkSuccess { next_node_id } => {
                self.finish_and_continue(node, Status::Succeeded, next_node_id)
                    .await
            }
            Advise::Retry { wait_ms } => self.retry(node, wait_ms).await,
            Advise::Abort => {
                self.abort_tree(&node.id, None).await?;
                let node = self.inner.nodes.get(&node.id).await?;
                self.branch_finished(&node).await
            }
            Advise::Pause => {
                self.update_node(&node.id, |n| n.pause()).await?;
                Ok(())
            }
            Advise::ManualIntervention {
                timeout_ms,
                timeout_action,
            } => {
                let (node, parked) = self
                    .update_node(&node.id, |n| n.enter_wait(Status::InterventionWaiting))
                    .await?;
                if let (true, Some(timeout_ms)) = (parked, timeout_ms) {
                    let runtime = self.runtime(&node.plan_execution_id)?;
                    let tracker = AbsoluteTimeoutTracker::new(saturating_millis(timeout_ms));
                    runtime.state.lock().timeouts.register(
                        &node.id,
                        Box::new(tracker),
                        timeout_action,
                        Utc::now(),
                    );
                }
                log::info!("Node '{}' waits for manual intervention", node.identifier);
                Ok(())
            }
            Advise::EndPlan => self.end_plan(node, outcome_status(node)).await,
        }
    }

    /// Schedule `next` (if any) and only then finish the node, so the plan
    /// never looks idle in between.
    pub(super) async fn finish_and_continue(
        &self,
        node: &NodeExecution,
        status: Status,
        next: Option<String>,
    ) -> Result<()> {
        let mut scheduled = false;
        if let Some(next) = &next {
            scheduled = self
                .schedule(&node.plan_execution_id, next, Placement::after(node))
                .await?
                .is_some();
        }
        let (node, finished) = self
            .update_node(&node.id, |n| n.transition(status))
            .await?;
        if finished && !scheduled {
            self.branch_finished(&node).await?;
        }
        Ok(())
    }

    async fn retry(&self, node: &NodeExecution, wait_ms: Option<u64>) -> Result<()> {
        let wait = wait_ms
            .map(std::time::Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.default_retry_wait());
        log::info!(
            "Retrying node '{}' (attempt {}) in {:?}",
            node.identifier,
            node.retry_count + 1,
            wait
        );
        let scheduled = self
            .schedule(
                &node.plan_execution_id,
                &node.plan_node_id,
                Placement::retry_of(node, wait),
            )
            .await?
            .is_some();

        let status = failed_status(node);
        let (node, finished) = self
            .update_node(&node.id, |n| {
                n.old_retry = scheduled;
                n.transition(status)
            })
            .await?;
        if finished && !scheduled {
            self.branch_finished(&node).await?;
        }
        Ok(())
    }

    async fn end_plan(&self, node: &NodeExecution, status: Status) -> Result<()> {
        self.update_node(&node.id, |n| n.transition(status)).await?;
        for other in self
            .inner
            .nodes
            .find_by_plan_execution(&node.plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| !n.is_terminal())
        {
            self.discontinue(&other.id, None).await?;
            self.finish_aborting(&other.id).await?;
        }
        log::info!(
            "Node '{}' ended plan execution '{}'",
            node.identifier,
            node.plan_execution_id
        );
        self.finish_plan(&node.plan_execution_id, status).await
    }

    /// The branch `node` belongs to has no more work scheduled.
    pub(super) async fn branch_finished(&self, node: &NodeExecution) -> Result<()> {
        let Some(runtime) = self.find_runtime(&node.plan_execution_id) else {
            // The execution already finished and released its state.
            return Ok(());
        };
        let branch_root = node
            .branch_id
            .clone()
            .unwrap_or_else(|| runtime.plan.starting_node_id.clone());

        // Barriers this branch never reached will not be reached any more.
        let participants: Vec<String> = runtime
            .plan
            .barriers_on_path(&branch_root)
            .into_iter()
            .map(|b| b.id.clone())
            .collect();
        let outcomes: Vec<BarrierOutcome> = {
            let mut state = runtime.state.lock();
            participants
                .iter()
                .map(|p| state.barriers.abandon(p))
                .collect()
        };
        for outcome in outcomes {
            self.handle_barrier_outcome(&node.plan_execution_id, outcome);
        }

        if let Some(parent_id) = &node.parent_id {
            self.record_branch_result(parent_id, node).await?;
        }
        self.check_plan_completion(&node.plan_execution_id).await
    }

    async fn record_branch_result(&self, parent_id: &str, node: &NodeExecution) -> Result<()> {
        let branch_id = node
            .branch_id
            .clone()
            .unwrap_or_else(|| node.plan_node_id.clone());
        let branch_status = Status::aggregate(
            self.inner
                .nodes
                .find_children(parent_id)
                .await?
                .iter()
                .filter(|n| n.branch_id.as_deref() == Some(branch_id.as_str()) && !n.old_retry)
                .map(|n| n.status),
        );

        let (parent, release) = self
            .update_node(parent_id, |p| {
                p.child_results.insert(branch_id.clone(), branch_status);
                if p.children_resolved || p.is_terminal() {
                    return Ok(false);
                }
                let (total, mode) = match p.executable_responses.last() {
                    Some(ExecutableResponse::Children {
                        child_node_ids,
                        mode,
                    }) => (child_node_ids.len(), *mode),
                    Some(ExecutableResponse::Child { .. }) => (1, ChildrenMode::All),
                    _ => return Ok(false),
                };
                if p.child_results.len() >= mode.required(total) {
                    p.children_resolved = true;
                    return Ok(true);
                }
                Ok(false)
            })
            .await?;
        log::debug!(
            "Branch '{}' of '{}' finished as {}",
            branch_id,
            parent.identifier,
            branch_status
        );
        if release {
            self.spawn_children_finished(parent.id);
        }
        Ok(())
    }

    /// Release a fan-out parent regardless of its child results.
    pub(super) async fn release_parent(&self, parent_id: &str) -> Result<()> {
        let (parent, release) = self
            .update_node(parent_id, |p| {
                if p.children_resolved || p.is_terminal() {
                    return Ok(false);
                }
                p.children_resolved = true;
                Ok(true)
            })
            .await?;
        if release {
            self.spawn_children_finished(parent.id);
        }
        Ok(())
    }

    fn spawn_children_finished(&self, parent_id: String) {
        let engine = self.clone();
        let id = parent_id.clone();
        self.spawn_for_node(parent_id, async move { engine.resolve_children(&id).await });
    }

    async fn resolve_children(&self, parent_id: &str) -> Result<()> {
        let parent = self.inner.nodes.get(parent_id).await?;
        if parent.is_terminal() {
            return Ok(());
        }
        let runtime = self.runtime(&parent.plan_execution_id)?;
        let plan_node = runtime.plan.fetch_node(&parent.plan_node_id)?;
        let step = self.inner.steps.get(&parent.step_type)?;

        let response = match step
            .on_children_finished(
                &parent.ambiance,
                &plan_node.step_parameters,
                &parent.child_results,
            )
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_integrity_error() => return Err(e),
            Err(e) => step_failure(&e, FailureType::ApplicationError),
        };
        self.decide(parent_id, response, None).await
    }

    /// Deliver a barrier verdict to the waiting participants.
    pub(super) fn handle_barrier_outcome(&self, plan_execution_id: &str, outcome: BarrierOutcome) {
        let (barrier_ref, participants, released) = match outcome {
            BarrierOutcome::Pending => return,
            BarrierOutcome::Released {
                barrier_ref,
                participants,
            } => (barrier_ref, participants, true),
            BarrierOutcome::Failed {
                barrier_ref,
                participants,
            } => (barrier_ref, participants, false),
        };
        self.emit(OrchestrationEvent::BarrierResolved {
            plan_execution_id: plan_execution_id.to_string(),
            barrier_ref,
            released,
            timestamp: Utc::now(),
        });

        for participant in participants {
            let engine = self.clone();
            let id = participant.clone();
            self.spawn_for_node(participant, async move {
                engine.deliver_barrier_verdict(&id, released).await
            });
        }
    }

    async fn deliver_barrier_verdict(&self, node_execution_id: &str, released: bool) -> Result<()> {
        if released {
            return self
                .decide(node_execution_id, StepResponse::success(Value::Null), None)
                .await;
        }

        // A failed barrier aborts its waiters without consulting their advisers.
        let failure = StepResponse::failure(FailureInfo::new(
            "Barrier failed",
            FailureType::ApplicationError,
        ));
        let (node, claimed) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() || n.advise_consumed {
                    return Ok(false);
                }
                n.failure_info = failure.failure_info.clone();
                n.outcome = Some(failure.clone());
                if n.adviser_response.is_none() {
                    n.adviser_response = Some(Advise::Abort);
                }
                n.advise_consumed = true;
                Ok(true)
            })
            .await?;
        if !claimed {
            return Ok(());
        }
        self.release_node_resources(&node).await;
        self.apply_advise(&node, Advise::Abort).await
    }

    /// Finish the plan execution once nothing is left running.
    pub(super) async fn check_plan_completion(&self, plan_execution_id: &str) -> Result<()> {
        let nodes = self
            .inner
            .nodes
            .find_by_plan_execution(plan_execution_id)
            .await?;
        let active: Vec<&NodeExecution> = nodes.iter().filter(|n| !n.is_terminal()).collect();

        if active.is_empty() {
            let status = Status::aggregate(
                nodes
                    .iter()
                    .filter(|n| n.parent_id.is_none() && !n.old_retry)
                    .map(|n| n.status),
            );
            return self.finish_plan(plan_execution_id, status).await;
        }

        // Only barrier waiters left: their missing forcers can never arrive.
        let leaves = active.iter().filter(|n| {
            !active
                .iter()
                .any(|c| c.parent_id.as_deref() == Some(n.id.as_str()))
        });
        let mut leaves = leaves.peekable();
        if leaves.peek().is_some()
            && leaves.all(|n| {
                n.mode == Some(ExecutionMode::Barrier) && n.status == Status::AsyncWaiting
            })
        {
            log::warn!(
                "Plan execution '{}' is stalled at barriers; abandoning them",
                plan_execution_id
            );
            let Some(runtime) = self.find_runtime(plan_execution_id) else {
                return Ok(());
            };
            let outcomes = runtime.state.lock().barriers.abandon_all();
            for outcome in outcomes {
                self.handle_barrier_outcome(plan_execution_id, outcome);
            }
        }
        Ok(())
    }

    pub(super) async fn finish_plan(&self, plan_execution_id: &str, status: Status) -> Result<()> {
        let (plan_execution, finished) = self
            .update_plan_execution(plan_execution_id, |pe| Ok(pe.finish(status)))
            .await?;
        if !finished {
            return Ok(());
        }
        log::info!(
            "Plan execution '{}' finished as {}",
            plan_execution_id,
            plan_execution.status
        );
        if let Some(runtime) = self.find_runtime(plan_execution_id) {
            let unresolved = runtime.state.lock().barriers.abandon_all();
            if !unresolved.is_empty() {
                log::debug!(
                    "{} barrier(s) of '{}' closed unresolved",
                    unresolved.len(),
                    plan_execution_id
                );
            }
            runtime.done.send_replace(Some(plan_execution.status));
        }
        self.release_runtime(plan_execution_id);
        Ok(())
    }
}
