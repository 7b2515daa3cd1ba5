//! Error types for the orchestration engine

use thiserror::Error;

use crate::execution::Status;
use crate::plan::ValidationError;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Plan failed structural validation
    #[error("Invalid plan: {}", format_validation_errors(.0))]
    InvalidPlan(Vec<ValidationError>),

    /// A required setup abstraction is absent from the ambiance
    #[error("Missing abstraction: {0}")]
    MissingAbstraction(String),

    /// The ambiance has no levels where one was required
    #[error("Ambiance has no levels")]
    EmptyAmbiance,

    /// Node execution not found
    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(String),

    /// Plan execution not found
    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    /// Plan node not found in the plan
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Plan node not found: {0}")]
    PlanNodeNotFound(String),

    /// Optimistic concurrency check failed
    #[error("Version conflict on '{id}': expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Optimistic update kept conflicting past the configured attempts
    #[error("Gave up updating '{0}' after repeated version conflicts")]
    ConflictRetriesExhausted(String),

    /// A status transition not permitted by the state machine
    #[error("Illegal transition for '{id}': {from:?} -> {to:?}")]
    IllegalTransition { id: String, from: Status, to: Status },

    /// No facilitator registered for a step type
    #[error("No facilitator registered for step type '{0}'")]
    NoFacilitator(String),

    /// No step implementation registered for a step type
    #[error("No step registered for step type '{0}'")]
    NoStep(String),

    /// Adviser type not present in the adviser registry
    #[error("Unknown adviser type: {0}")]
    UnknownAdviser(String),

    /// Timeout tracker type not present in the registry
    #[error("Unknown timeout tracker type: {0}")]
    UnknownTimeoutTracker(String),

    /// The step returned a response that does not match the facilitated mode
    #[error("Step '{step_type}' returned a {actual} response in {expected} mode")]
    ModeMismatch {
        step_type: String,
        expected: String,
        actual: String,
    },

    /// Parameters could not be decoded for an adviser, tracker or step
    #[error("Invalid parameters for '{owner}': {message}")]
    InvalidParameters { owner: String, message: String },

    /// The task dispatcher rejected a task
    #[error("Task dispatch failed: {0}")]
    Dispatch(String),

    /// A step implementation returned an error
    #[error("Step execution failed: {0}")]
    StepFailed(String),

    /// Persisted state that the engine cannot interpret
    #[error("Corrupt execution state: {0}")]
    CorruptState(String),

    #[error("Plan execution '{plan_execution_id}' exceeded {limit} node executions")]
    ExecutionLimitExceeded { plan_execution_id: String, limit: u32 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a step failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::StepFailed(msg.into())
    }

    /// Create an invalid parameters error
    pub fn invalid_parameters(owner: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidParameters {
            owner: owner.into(),
            message: message.to_string(),
        }
    }

    /// Integrity errors make the execution structurally unable to continue.
    ///
    /// The affected node is marked ERRORED instead of being handed to advisers.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPlan(_)
                | Self::NoFacilitator(_)
                | Self::NoStep(_)
                | Self::UnknownAdviser(_)
                | Self::UnknownTimeoutTracker(_)
                | Self::ModeMismatch { .. }
                | Self::PlanNodeNotFound(_)
                | Self::CorruptState(_)
                | Self::ExecutionLimitExceeded { .. }
                | Self::InvalidParameters { .. }
                | Self::EmptyAmbiance
        )
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
