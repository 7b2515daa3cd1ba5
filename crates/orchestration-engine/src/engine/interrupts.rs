//! Interrupt handling: registration, application, crash replay and the
//! depth-first abort of node subtrees.

use chrono::Utc;

use super::advise::default_advise;
use super::OrchestrationEngine;
use crate::adviser::Advise;
use crate::error::{EngineError, Result};
use crate::events::OrchestrationEvent;
use crate::execution::{FailureInfo, FailureType, NodeExecution, Status, StepResponse};
use crate::interrupt::{Interrupt, InterruptEffect, InterruptState, InterruptType};

impl OrchestrationEngine {
    /// Register an interrupt and apply it.
    ///
    /// The interrupt is persisted as REGISTERED before anything is touched
    /// and marked PROCESSED or DISCARDED afterwards, so an interrupted
    /// application is picked up again by
    /// [`replay_pending_interrupts`](Self::replay_pending_interrupts).
    pub async fn interrupt(&self, mut interrupt: Interrupt) -> Result<Interrupt> {
        interrupt.state = InterruptState::Registered;
        let interrupt = self.inner.interrupts.save(interrupt).await?;
        log::info!(
            "Interrupt {} ({}) on plan execution '{}'",
            interrupt.interrupt_type,
            interrupt.id,
            interrupt.plan_execution_id
        );
        self.process_interrupt(interrupt).await
    }

    /// Re-apply interrupts left REGISTERED, e.g. after a crash.
    pub async fn replay_pending_interrupts(&self) -> Result<usize> {
        let pending = self.inner.interrupts.find_registered(None).await?;
        let count = pending.len();
        for interrupt in pending {
            log::info!(
                "Replaying interrupt {} ({})",
                interrupt.interrupt_type,
                interrupt.id
            );
            self.process_interrupt(interrupt).await?;
        }
        Ok(count)
    }

    async fn process_interrupt(&self, mut interrupt: Interrupt) -> Result<Interrupt> {
        let applied = self.apply_interrupt(&interrupt).await?;
        let state = if applied {
            InterruptState::Processed
        } else {
            log::info!("Discarding interrupt {} ({})", interrupt.interrupt_type, interrupt.id);
            InterruptState::Discarded
        };
        self.inner.interrupts.mark(&interrupt.id, state).await?;
        interrupt.state = state;
        Ok(interrupt)
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<bool> {
        let plan_execution = self
            .inner
            .plan_executions
            .get(&interrupt.plan_execution_id)
            .await?;
        if plan_execution.is_terminal() {
            return Ok(false);
        }
        let effect = interrupt.effect();

        let applied = match interrupt.interrupt_type {
            InterruptType::AbortAll => self.abort_all(interrupt, &effect).await?,
            InterruptType::PauseAll => self.pause_all(interrupt, &effect).await?,
            InterruptType::ResumeAll => self.resume_all(interrupt, &effect).await?,
            kind => {
                let node_execution_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
                    EngineError::invalid_parameters(
                        kind.to_string(),
                        "a node interrupt needs a node execution id",
                    )
                })?;
                let node = self.inner.nodes.get(node_execution_id).await?;
                if node.plan_execution_id != interrupt.plan_execution_id {
                    return Err(EngineError::invalid_parameters(
                        kind.to_string(),
                        format!(
                            "node execution '{}' does not belong to plan execution '{}'",
                            node.id, interrupt.plan_execution_id
                        ),
                    ));
                }
                // Replays of an abort finish what the first attempt started.
                if node.has_interrupt(&interrupt.id)
                    && (node.is_terminal() || kind != InterruptType::Abort)
                {
                    return Ok(true);
                }
                if node.is_terminal() {
                    return Ok(false);
                }
                self.apply_node_interrupt(&node, interrupt, effect).await?
            }
        };

        if applied {
            self.emit(OrchestrationEvent::InterruptApplied {
                plan_execution_id: interrupt.plan_execution_id.clone(),
                node_execution_id: interrupt.node_execution_id.clone(),
                interrupt_id: interrupt.id.clone(),
                interrupt_type: interrupt.interrupt_type,
                timestamp: Utc::now(),
            });
        }
        Ok(applied)
    }

    async fn apply_node_interrupt(
        &self,
        node: &NodeExecution,
        interrupt: &Interrupt,
        effect: InterruptEffect,
    ) -> Result<bool> {
        match interrupt.interrupt_type {
            InterruptType::Abort => {
                self.abort_tree(&node.id, Some(&effect)).await?;
                let node = self.inner.nodes.get(&node.id).await?;
                self.branch_finished(&node).await?;
                Ok(true)
            }
            InterruptType::Pause => {
                let (_, paused) = self
                    .update_node(&node.id, |n| {
                        if !n.status.can_transition_to(Status::Paused) {
                            return Ok(false);
                        }
                        n.pause()?;
                        n.interrupt_history.push(effect.clone());
                        Ok(true)
                    })
                    .await?;
                Ok(paused)
            }
            InterruptType::Resume => self.resume_paused(&node.id, Some(effect)).await,
            InterruptType::Retry | InterruptType::Ignore | InterruptType::MarkSuccess => {
                let runtime = self.runtime(&node.plan_execution_id)?;
                let next_node_id = runtime
                    .plan
                    .fetch_node(&node.plan_node_id)?
                    .next_node_id
                    .clone();
                let advise = match interrupt.interrupt_type {
                    InterruptType::Retry => Advise::Retry { wait_ms: None },
                    InterruptType::Ignore => Advise::Ignore { next_node_id },
                    _ => Advise::MarkSuccess { next_node_id },
                };
                self.force_advise(node, advise, effect).await
            }
            InterruptType::MarkExpired | InterruptType::MarkFailed | InterruptType::CustomFailure => {
                let (status, failure) = if interrupt.interrupt_type == InterruptType::MarkExpired {
                    (
                        Status::Expired,
                        interrupt.failure_info.clone().unwrap_or_else(FailureInfo::expired),
                    )
                } else {
                    (
                        Status::Failed,
                        interrupt.failure_info.clone().unwrap_or_else(|| {
                            FailureInfo::new(
                                format!("Marked failed by '{}'", interrupt.issued_by),
                                FailureType::ApplicationError,
                            )
                        }),
                    )
                };

                if node.status == Status::InterventionWaiting {
                    // Operator verdict on a parked node is final.
                    let (node, finished) = self
                        .update_node(&node.id, |n| {
                            n.interrupt_history.push(effect.clone());
                            n.failure_info = Some(failure.clone());
                            n.transition(status)
                        })
                        .await?;
                    if finished {
                        self.release_node_resources(&node).await;
                        self.branch_finished(&node).await?;
                    }
                    return Ok(finished);
                }

                self.decide(
                    &node.id,
                    StepResponse::with_status(status, Some(failure)),
                    Some(effect),
                )
                .await?;
                Ok(true)
            }
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll => {
                Ok(false)
            }
        }
    }

    /// Apply an operator action in place of the node's own advise.
    async fn force_advise(
        &self,
        node: &NodeExecution,
        advise: Advise,
        effect: InterruptEffect,
    ) -> Result<bool> {
        let (node, forced) = self
            .update_node(&node.id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                n.interrupt_history.push(effect.clone());
                n.advise_consumed = true;
                Ok(true)
            })
            .await?;
        if !forced {
            return Ok(false);
        }
        self.release_node_resources(&node).await;
        self.apply_advise(&node, advise).await?;
        Ok(true)
    }

    /// Leave PAUSED and pick the node up where it stopped.
    pub(super) async fn resume_paused(
        &self,
        node_execution_id: &str,
        effect: Option<InterruptEffect>,
    ) -> Result<bool> {
        let (node, resumed) = self
            .update_node(node_execution_id, |n| {
                if n.status != Status::Paused {
                    return Ok(None);
                }
                if let Some(effect) = &effect {
                    if !n.has_interrupt(&effect.interrupt_id) {
                        n.interrupt_history.push(effect.clone());
                    }
                }
                let from = n.paused_from;
                if from != Some(Status::Queued) {
                    let target = n.resume_target();
                    n.transition(target)?;
                    n.paused_from = None;
                }
                Ok(Some((from, std::mem::take(&mut n.pending_responses))))
            })
            .await?;
        let Some((from, pending)) = resumed else {
            return Ok(false);
        };
        log::info!("Resuming node '{}'", node.identifier);

        if from == Some(Status::Queued) {
            self.begin(&node.id).await?;
        } else if !pending.is_empty() {
            self.resume_node(&node.id, pending).await?;
        } else if node.outcome.is_some() {
            if node.advise_consumed {
                // Paused by its own advise; carry on as if none had been given.
                let runtime = self.runtime(&node.plan_execution_id)?;
                let plan_node = runtime.plan.fetch_node(&node.plan_node_id)?;
                let advise = default_advise(node.outcome.as_ref(), plan_node);
                self.apply_advise(&node, advise).await?;
            } else {
                self.conclude(&node).await?;
            }
        }
        Ok(true)
    }

    async fn abort_all(&self, interrupt: &Interrupt, effect: &InterruptEffect) -> Result<bool> {
        self.mark_leaves_discontinuing(&interrupt.plan_execution_id, Some(effect))
            .await?;
        let nodes = self
            .inner
            .nodes
            .find_by_plan_execution(&interrupt.plan_execution_id)
            .await?;
        for root in nodes
            .iter()
            .filter(|n| !n.is_terminal() && n.parent_id.is_none())
        {
            self.abort_tree(&root.id, Some(effect)).await?;
        }
        // Stragglers whose parent already finished.
        for node in self
            .inner
            .nodes
            .find_by_plan_execution(&interrupt.plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| !n.is_terminal())
        {
            self.abort_tree(&node.id, Some(effect)).await?;
        }
        self.finish_plan(&interrupt.plan_execution_id, Status::Aborted)
            .await?;
        Ok(true)
    }

    async fn pause_all(&self, interrupt: &Interrupt, effect: &InterruptEffect) -> Result<bool> {
        self.update_plan_execution(&interrupt.plan_execution_id, |pe| {
            pe.pause_requested = true;
            Ok(())
        })
        .await?;
        let leaves = self
            .inner
            .nodes
            .find_active_leaves(&interrupt.plan_execution_id)
            .await?;
        for leaf in leaves {
            self.update_node(&leaf.id, |n| {
                if !n.status.can_transition_to(Status::Paused) {
                    return Ok(false);
                }
                n.pause()?;
                n.interrupt_history.push(effect.clone());
                Ok(true)
            })
            .await?;
        }
        Ok(true)
    }

    async fn resume_all(&self, interrupt: &Interrupt, effect: &InterruptEffect) -> Result<bool> {
        self.update_plan_execution(&interrupt.plan_execution_id, |pe| {
            pe.pause_requested = false;
            Ok(())
        })
        .await?;
        for node in self
            .inner
            .nodes
            .find_by_plan_execution(&interrupt.plan_execution_id)
            .await?
            .into_iter()
            .filter(|n| n.status == Status::Paused)
        {
            self.resume_paused(&node.id, Some(effect.clone())).await?;
        }
        Ok(true)
    }

    /// Abort `root_id` and its non-terminal descendants.
    ///
    /// The target goes first, then descendants depth-first in pre-order,
    /// siblings in creation order. Every node passes through DISCONTINUING
    /// before the step is told and the node becomes ABORTED. Returns the
    /// affected node execution ids in that order.
    pub(super) async fn abort_tree(
        &self,
        root_id: &str,
        effect: Option<&InterruptEffect>,
    ) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut stack = vec![root_id.to_string()];
        while let Some(id) = stack.pop() {
            let children = self.inner.nodes.find_children(&id).await?;
            stack.extend(
                children
                    .into_iter()
                    .filter(|c| !c.is_terminal())
                    .map(|c| c.id)
                    .rev(),
            );
            order.push(id);
        }

        for id in &order {
            self.discontinue(id, effect).await?;
        }
        for id in &order {
            self.finish_aborting(id).await?;
        }
        log::info!("Aborted {} node execution(s) under '{}'", order.len(), root_id);
        Ok(order)
    }

    /// Move every active leaf of the plan execution to DISCONTINUING so no
    /// branch picks up new work. Returns the ids that changed.
    pub async fn mark_leaves_discontinuing(
        &self,
        plan_execution_id: &str,
        effect: Option<&InterruptEffect>,
    ) -> Result<Vec<String>> {
        let mut marked = Vec::new();
        for leaf in self
            .inner
            .nodes
            .find_active_leaves(plan_execution_id)
            .await?
        {
            if self.discontinue(&leaf.id, effect).await? {
                marked.push(leaf.id);
            }
        }
        log::debug!(
            "Marked {} leaf node(s) of '{}' as discontinuing",
            marked.len(),
            plan_execution_id
        );
        Ok(marked)
    }

    pub(super) async fn discontinue(
        &self,
        node_execution_id: &str,
        effect: Option<&InterruptEffect>,
    ) -> Result<bool> {
        let (_, changed) = self
            .update_node(node_execution_id, |n| {
                if n.is_terminal() {
                    return Ok(false);
                }
                if let Some(effect) = effect {
                    if !n.has_interrupt(&effect.interrupt_id) {
                        n.interrupt_history.push(effect.clone());
                    }
                }
                if n.status != Status::Discontinuing {
                    n.transition(Status::Discontinuing)?;
                }
                Ok(true)
            })
            .await?;
        Ok(changed)
    }

    pub(super) async fn finish_aborting(&self, node_execution_id: &str) -> Result<()> {
        let node = self.inner.nodes.get(node_execution_id).await?;
        if node.is_terminal() {
            return Ok(());
        }
        self.release_node_resources(&node).await;

        if let (Ok(step), Some(runtime)) = (
            self.inner.steps.get(&node.step_type),
            self.find_runtime(&node.plan_execution_id),
        ) {
            if let Some(plan_node) = runtime.plan.node(&node.plan_node_id) {
                if let Err(e) = step.on_abort(&node.ambiance, &plan_node.step_parameters).await {
                    log::warn!("Step '{}' failed to abort cleanly: {}", node.identifier, e);
                }
            }
        }

        self.update_node(node_execution_id, |n| n.transition(Status::Aborted))
            .await?;
        Ok(())
    }
}
