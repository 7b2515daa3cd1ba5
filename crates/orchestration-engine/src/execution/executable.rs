//! Execution modes, step responses and failure descriptions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::status::Status;

/// Response payloads keyed by correlation id (or child node execution id).
pub type ResponseMap = HashMap<String, Value>;

/// How a node is executed, as decided by its facilitator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    TaskChain,
    Child,
    Children,
    /// Rendezvous node handled by the engine itself.
    Barrier,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::Barrier => "BARRIER",
        }
    }
}

/// Failure classes that drive adviser selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Expired,
    NoEligibleDelegate,
    Connectivity,
    ApplicationError,
    AuthenticationError,
    AuthorizationError,
    Unknown,
}

impl FailureType {
    /// Failures that may succeed if simply tried again.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureType::NoEligibleDelegate | FailureType::Connectivity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }

    pub fn expired() -> Self {
        Self::new("Timeout expired", FailureType::Expired)
    }

    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }

    pub fn is_transient(&self) -> bool {
        !self.failure_types.is_empty() && self.failure_types.iter().all(|t| t.is_transient())
    }
}

/// Final result of a step, consumed at a decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub output: Value,
}

impl StepResponse {
    pub fn success(output: Value) -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            output,
        }
    }

    pub fn failure(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            output: Value::Null,
        }
    }

    pub fn with_status(status: Status, failure_info: Option<FailureInfo>) -> Self {
        Self {
            status,
            failure_info,
            output: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.status.is_broken()
    }
}

/// How many child branches must finish before the parent resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildrenMode {
    All,
    Min { count: usize },
}

impl ChildrenMode {
    /// Number of finished branches that releases the parent.
    pub fn required(self, total: usize) -> usize {
        match self {
            ChildrenMode::All => total,
            ChildrenMode::Min { count } => count.min(total),
        }
    }
}

/// What a step hands back to the engine when started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    /// The step finished inline.
    Sync(StepResponse),
    /// The step will be resumed once every callback id has a response.
    #[serde(rename_all = "camelCase")]
    Async { callback_ids: Vec<String> },
    /// A task to hand to the delegate pool; the task id doubles as correlation id.
    #[serde(rename_all = "camelCase")]
    Task {
        task_id: String,
        task_identifier: String,
        #[serde(default)]
        payload: Value,
    },
    /// One link of a task chain; the step is asked for the next link until
    /// `chain_end` is set.
    #[serde(rename_all = "camelCase")]
    TaskChain {
        task_id: String,
        task_identifier: String,
        #[serde(default)]
        payload: Value,
        chain_end: bool,
        #[serde(default)]
        pass_through: Value,
    },
    /// Run a single child plan node, then resume.
    #[serde(rename_all = "camelCase")]
    Child { child_node_id: String },
    /// Fan out to several child plan nodes.
    #[serde(rename_all = "camelCase")]
    Children {
        child_node_ids: Vec<String>,
        mode: ChildrenMode,
    },
}

impl ExecutableResponse {
    /// Build a task response with a freshly minted task id.
    pub fn task(task_identifier: impl Into<String>, payload: Value) -> Self {
        ExecutableResponse::Task {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_identifier: task_identifier.into(),
            payload,
        }
    }

    /// Build a task chain link with a freshly minted task id.
    pub fn task_chain_link(
        task_identifier: impl Into<String>,
        payload: Value,
        chain_end: bool,
        pass_through: Value,
    ) -> Self {
        ExecutableResponse::TaskChain {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_identifier: task_identifier.into(),
            payload,
            chain_end,
            pass_through,
        }
    }

    /// The execution mode this response belongs to.
    pub fn mode(&self) -> ExecutionMode {
        match self {
            ExecutableResponse::Sync(_) => ExecutionMode::Sync,
            ExecutableResponse::Async { .. } => ExecutionMode::Async,
            ExecutableResponse::Task { .. } => ExecutionMode::Task,
            ExecutableResponse::TaskChain { .. } => ExecutionMode::TaskChain,
            ExecutableResponse::Child { .. } => ExecutionMode::Child,
            ExecutableResponse::Children { .. } => ExecutionMode::Children,
        }
    }

    /// Whether this response is acceptable for a node facilitated in `mode`.
    ///
    /// Async-style modes may still complete inline with a Sync response.
    pub fn fits_mode(&self, mode: ExecutionMode) -> bool {
        let actual = self.mode();
        actual == mode
            || (matches!(actual, ExecutionMode::Sync)
                && matches!(
                    mode,
                    ExecutionMode::Async | ExecutionMode::Task | ExecutionMode::TaskChain
                ))
            || (matches!(actual, ExecutionMode::Child) && mode == ExecutionMode::Children)
    }
}
