//! Run-time instantiation of a plan node.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::executable::{ExecutableResponse, ExecutionMode, FailureInfo, ResponseMap, StepResponse};
use super::status::Status;
use crate::adviser::Advise;
use crate::ambiance::Ambiance;
use crate::error::{EngineError, Result};
use crate::interrupt::InterruptEffect;

/// A single run of a plan node within a plan execution.
///
/// Persisted with an optimistic `version`; every mutation goes through a
/// compare-and-swap on that version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    /// Fan-out parent, if this node runs inside a child branch.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Plan node id of the branch root under `parent_id`.
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Node execution that scheduled this one.
    #[serde(default)]
    pub previous_id: Option<String>,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub version: u64,
    /// Retries that preceded this execution of the same plan node.
    #[serde(default)]
    pub retry_count: u32,
    /// Ids of the executions this one retried, oldest first.
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// Set once a newer execution has replaced this one.
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    /// The advise produced at this node's decision point. Written once.
    #[serde(default)]
    pub adviser_response: Option<Advise>,
    /// Set by whoever applies the advise, so it is applied once.
    #[serde(default)]
    pub advise_consumed: bool,
    /// Step outcome recorded at the decision point, before the advise is applied.
    #[serde(default)]
    pub outcome: Option<StepResponse>,
    /// Status to restore when a PAUSED node is resumed.
    #[serde(default)]
    pub paused_from: Option<Status>,
    /// Correlation responses that arrived while the node was paused.
    #[serde(default)]
    pub pending_responses: ResponseMap,
    /// Final status per child branch, keyed by branch root plan node id.
    #[serde(default)]
    pub child_results: HashMap<String, Status>,
    /// Set once the fan-out wait has released the parent.
    #[serde(default)]
    pub children_resolved: bool,
    #[serde(default)]
    pub output: serde_json::Value,
}

impl NodeExecution {
    pub fn new(
        id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        plan_node_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
        ambiance: Ambiance,
    ) -> Self {
        Self {
            id: id.into(),
            plan_execution_id: plan_execution_id.into(),
            plan_node_id: plan_node_id.into(),
            identifier: identifier.into(),
            step_type: step_type.into(),
            parent_id: None,
            branch_id: None,
            previous_id: None,
            ambiance,
            status: Status::Queued,
            mode: None,
            start_ts: None,
            end_ts: None,
            failure_info: None,
            version: 0,
            retry_count: 0,
            retry_ids: Vec::new(),
            old_retry: false,
            executable_responses: Vec::new(),
            interrupt_history: Vec::new(),
            adviser_response: None,
            advise_consumed: false,
            outcome: None,
            paused_from: None,
            pending_responses: ResponseMap::new(),
            child_results: HashMap::new(),
            children_resolved: false,
            output: serde_json::Value::Null,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(false)` without touching anything when the node is already
    /// terminal, and an error when the state machine forbids the move.
    pub fn transition(&mut self, to: Status) -> Result<bool> {
        if self.status.is_terminal() {
            return Ok(false);
        }
        if !self.status.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        let now = Utc::now();
        if to == Status::Running && self.start_ts.is_none() {
            self.start_ts = Some(now);
        }
        if to.is_terminal() {
            self.end_ts = Some(now);
            self.paused_from = None;
        }
        self.status = to;
        Ok(true)
    }

    /// Pause, remembering where to come back to.
    pub fn pause(&mut self) -> Result<bool> {
        let from = self.status;
        let changed = self.transition(Status::Paused)?;
        if changed {
            self.paused_from = Some(from);
        }
        Ok(changed)
    }

    /// Move into a waiting status. A paused node stays paused and will
    /// resume into `to`.
    pub fn enter_wait(&mut self, to: Status) -> Result<bool> {
        if self.status == Status::Paused {
            self.paused_from = Some(to);
            return Ok(true);
        }
        self.transition(to)
    }

    /// Status to restore when leaving PAUSED. Nodes paused before they
    /// started come back as RUNNING.
    pub fn resume_target(&self) -> Status {
        match self.paused_from {
            Some(Status::Queued) | None => Status::Running,
            Some(status) => status,
        }
    }

    pub fn has_interrupt(&self, interrupt_id: &str) -> bool {
        self.interrupt_history
            .iter()
            .any(|e| e.interrupt_id == interrupt_id)
    }

    /// Callback ids this node is currently waiting on.
    pub fn awaited_callback_ids(&self) -> Vec<String> {
        match self.executable_responses.last() {
            Some(ExecutableResponse::Async { callback_ids }) => callback_ids.clone(),
            Some(ExecutableResponse::Task { task_id, .. })
            | Some(ExecutableResponse::TaskChain { task_id, .. }) => vec![task_id.clone()],
            _ => Vec::new(),
        }
    }
}
