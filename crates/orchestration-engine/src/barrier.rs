//! Barrier/forcer rendezvous for parallel branches.
//!
//! Every BARRIER node of a plan is a forcer of the barrier named by its
//! `barrierRef`. A barrier releases once all its forcers have ARRIVED and fails
//! as soon as one is ABANDONED, whatever the order of the other arrivals. The
//! barrier is re-evaluated only when a forcer changes state, and its
//! resolution is final.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForcerState {
    Absent,
    Approaching,
    Arrived,
    Abandoned,
}

impl ForcerState {
    pub fn is_final(self) -> bool {
        matches!(self, ForcerState::Arrived | ForcerState::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarrierStatus {
    Pending,
    Released,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forcer {
    /// Plan node id of the BARRIER node.
    pub participant_id: String,
    pub state: ForcerState,
    /// Node execution waiting at the barrier, once arrived.
    #[serde(default)]
    pub node_execution_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Barrier {
    pub barrier_ref: String,
    pub forcers: Vec<Forcer>,
    pub status: BarrierStatus,
}

impl Barrier {
    fn evaluate(&self) -> BarrierStatus {
        if self.forcers.iter().any(|f| f.state == ForcerState::Abandoned) {
            BarrierStatus::Failed
        } else if self.forcers.iter().all(|f| f.state == ForcerState::Arrived) {
            BarrierStatus::Released
        } else {
            BarrierStatus::Pending
        }
    }

    fn arrived_executions(&self) -> Vec<String> {
        self.forcers
            .iter()
            .filter(|f| f.state == ForcerState::Arrived)
            .filter_map(|f| f.node_execution_id.clone())
            .collect()
    }
}

/// What the caller must do after a forcer change.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierOutcome {
    /// Nothing to do yet.
    Pending,
    /// Barrier released; resume these waiting node executions.
    Released {
        barrier_ref: String,
        participants: Vec<String>,
    },
    /// Barrier failed; deliver the failure to these waiting node executions.
    Failed {
        barrier_ref: String,
        participants: Vec<String>,
    },
}

/// Barriers of one plan execution.
#[derive(Debug, Default)]
pub struct BarrierEngine {
    barriers: HashMap<String, Barrier>,
    participant_index: HashMap<String, String>,
}

impl BarrierEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a barrier per `barrierRef` found in the plan.
    pub fn from_plan(plan: &Plan) -> Self {
        let mut engine = Self::new();
        for (barrier_ref, participants) in plan.barrier_participants() {
            engine.register(barrier_ref, participants);
        }
        engine
    }

    pub fn register(&mut self, barrier_ref: impl Into<String>, participant_ids: Vec<String>) {
        let barrier_ref = barrier_ref.into();
        for participant in &participant_ids {
            self.participant_index
                .insert(participant.clone(), barrier_ref.clone());
        }
        let forcers = participant_ids
            .into_iter()
            .map(|participant_id| Forcer {
                participant_id,
                state: ForcerState::Absent,
                node_execution_id: None,
            })
            .collect();
        log::debug!("Registered barrier '{}'", barrier_ref);
        self.barriers.insert(
            barrier_ref.clone(),
            Barrier {
                barrier_ref,
                forcers,
                status: BarrierStatus::Pending,
            },
        );
    }

    pub fn barrier(&self, barrier_ref: &str) -> Option<&Barrier> {
        self.barriers.get(barrier_ref)
    }

    pub fn forcer_state(&self, participant_id: &str) -> Option<ForcerState> {
        let barrier_ref = self.participant_index.get(participant_id)?;
        self.barriers
            .get(barrier_ref)?
            .forcers
            .iter()
            .find(|f| f.participant_id == participant_id)
            .map(|f| f.state)
    }

    /// The branch containing `participant_id` has started.
    pub fn approach(&mut self, participant_id: &str) -> BarrierOutcome {
        self.update(participant_id, ForcerState::Approaching, None)
    }

    /// The BARRIER node `participant_id` is waiting as `node_execution_id`.
    pub fn arrive(&mut self, participant_id: &str, node_execution_id: &str) -> BarrierOutcome {
        self.update(
            participant_id,
            ForcerState::Arrived,
            Some(node_execution_id.to_string()),
        )
    }

    /// The branch containing `participant_id` ended without reaching it.
    pub fn abandon(&mut self, participant_id: &str) -> BarrierOutcome {
        self.update(participant_id, ForcerState::Abandoned, None)
    }

    /// Abandon every forcer still short of ARRIVED, e.g. when the plan ends.
    pub fn abandon_all(&mut self) -> Vec<BarrierOutcome> {
        let pending: Vec<String> = self
            .barriers
            .values()
            .flat_map(|b| b.forcers.iter())
            .filter(|f| !f.state.is_final())
            .map(|f| f.participant_id.clone())
            .collect();
        pending
            .iter()
            .map(|p| self.abandon(p))
            .filter(|o| *o != BarrierOutcome::Pending)
            .collect()
    }

    fn update(
        &mut self,
        participant_id: &str,
        to: ForcerState,
        node_execution_id: Option<String>,
    ) -> BarrierOutcome {
        let Some(barrier_ref) = self.participant_index.get(participant_id) else {
            log::warn!("'{}' is not a participant of any barrier", participant_id);
            return BarrierOutcome::Pending;
        };
        let Some(barrier) = self.barriers.get_mut(barrier_ref) else {
            return BarrierOutcome::Pending;
        };
        let Some(forcer) = barrier
            .forcers
            .iter_mut()
            .find(|f| f.participant_id == participant_id)
        else {
            return BarrierOutcome::Pending;
        };

        let allowed = match (forcer.state, to) {
            (ForcerState::Absent, ForcerState::Approaching) => true,
            (from, ForcerState::Arrived) => !from.is_final(),
            (from, ForcerState::Abandoned) => !from.is_final(),
            _ => false,
        };
        if !allowed {
            return BarrierOutcome::Pending;
        }
        forcer.state = to;
        if node_execution_id.is_some() {
            forcer.node_execution_id = node_execution_id.clone();
        }
        log::debug!(
            "Forcer '{}' of barrier '{}' is now {:?}",
            participant_id,
            barrier.barrier_ref,
            to
        );

        // A resolved barrier stays resolved; a late arrival learns the verdict alone.
        match barrier.status {
            BarrierStatus::Released | BarrierStatus::Failed => {
                let participants = match (to, node_execution_id) {
                    (ForcerState::Arrived, Some(id)) => vec![id],
                    _ => return BarrierOutcome::Pending,
                };
                return Self::outcome(barrier.status, &barrier.barrier_ref, participants);
            }
            BarrierStatus::Pending => {}
        }

        let status = barrier.evaluate();
        if status == BarrierStatus::Pending {
            return BarrierOutcome::Pending;
        }
        barrier.status = status;
        log::info!("Barrier '{}' resolved as {:?}", barrier.barrier_ref, status);
        Self::outcome(status, &barrier.barrier_ref, barrier.arrived_executions())
    }

    fn outcome(status: BarrierStatus, barrier_ref: &str, participants: Vec<String>) -> BarrierOutcome {
        match status {
            BarrierStatus::Released => BarrierOutcome::Released {
                barrier_ref: barrier_ref.to_string(),
                participants,
            },
            BarrierStatus::Failed => BarrierOutcome::Failed {
                barrier_ref: barrier_ref.to_string(),
                participants,
            },
            BarrierStatus::Pending => BarrierOutcome::Pending,
        }
    }
}
