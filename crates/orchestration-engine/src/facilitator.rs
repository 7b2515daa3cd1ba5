//! Facilitators decide how a node executes.
//!
//! A facilitator is a pure decision function: given the ambiance and step
//! parameters it returns the execution mode. It never touches engine state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::error::{EngineError, Result};
use crate::execution::ExecutionMode;
use crate::plan::BARRIER_STEP_TYPE;

/// Step parameter read by [`ModeFacilitator`] to delay the start of a node.
pub const INITIAL_WAIT_PARAM: &str = "initialWaitMs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorResponse {
    pub execution_mode: ExecutionMode,
    /// Delay before the step is started.
    #[serde(default)]
    pub initial_wait_ms: u64,
}

impl FacilitatorResponse {
    pub fn new(execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            initial_wait_ms: 0,
        }
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }
}

pub trait Facilitator: Send + Sync {
    /// Name used in precedence lists and diagnostics.
    fn facilitator_type(&self) -> &str;

    fn facilitate(&self, ambiance: &Ambiance, parameters: &Value) -> Result<FacilitatorResponse>;
}

/// Facilitator that always answers with a fixed mode.
pub struct ModeFacilitator {
    facilitator_type: String,
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(facilitator_type: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            mode,
        }
    }

    /// Facilitator named after its mode, e.g. "TASK".
    pub fn for_mode(mode: ExecutionMode) -> Self {
        Self::new(mode.as_str(), mode)
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitator_type(&self) -> &str {
        &self.facilitator_type
    }

    fn facilitate(&self, _ambiance: &Ambiance, parameters: &Value) -> Result<FacilitatorResponse> {
        let initial_wait_ms = match parameters.get(INITIAL_WAIT_PARAM) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                EngineError::invalid_parameters(
                    self.facilitator_type.as_str(),
                    format!("{} must be a non-negative integer", INITIAL_WAIT_PARAM),
                )
            })?,
        };
        Ok(FacilitatorResponse {
            execution_mode: self.mode,
            initial_wait_ms,
        })
    }
}

/// Maps step types to the facilitators that claim them.
///
/// When several facilitators claim one step type, the one listed earliest in
/// the precedence list wins; without a precedence entry the first registered
/// wins and the step type is reported as ambiguous.
#[derive(Default)]
pub struct FacilitatorRegistry {
    entries: HashMap<String, Vec<Arc<dyn Facilitator>>>,
    precedence: Vec<String>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the engine-handled BARRIER step type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            BARRIER_STEP_TYPE,
            Arc::new(ModeFacilitator::for_mode(ExecutionMode::Barrier)),
        );
        registry
    }

    pub fn set_precedence(&mut self, precedence: Vec<String>) {
        self.precedence = precedence;
    }

    pub fn register(&mut self, step_type: impl Into<String>, facilitator: Arc<dyn Facilitator>) {
        let step_type = step_type.into();
        log::debug!(
            "Registering facilitator '{}' for step type '{}'",
            facilitator.facilitator_type(),
            step_type
        );
        self.entries.entry(step_type).or_default().push(facilitator);
    }

    /// Facilitator types claiming `step_type`, in registration order.
    pub fn facilitators_for(&self, step_type: &str) -> Vec<String> {
        self.entries
            .get(step_type)
            .map(|fs| fs.iter().map(|f| f.facilitator_type().to_string()).collect())
            .unwrap_or_default()
    }

    fn precedence_rank(&self, facilitator_type: &str) -> Option<usize> {
        self.precedence.iter().position(|p| p == facilitator_type)
    }

    pub fn is_ambiguous(&self, step_type: &str) -> bool {
        match self.entries.get(step_type) {
            Some(fs) if fs.len() > 1 => fs
                .iter()
                .all(|f| self.precedence_rank(f.facilitator_type()).is_none()),
            _ => false,
        }
    }

    pub fn ambiguous_step_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .entries
            .keys()
            .map(String::as_str)
            .filter(|t| self.is_ambiguous(t))
            .collect();
        types.sort_unstable();
        types
    }

    /// Pick the facilitator for `step_type`.
    pub fn resolve(&self, step_type: &str) -> Result<Arc<dyn Facilitator>> {
        let claimants = self
            .entries
            .get(step_type)
            .filter(|fs| !fs.is_empty())
            .ok_or_else(|| EngineError::NoFacilitator(step_type.to_string()))?;

        let ranked = claimants
            .iter()
            .filter_map(|f| self.precedence_rank(f.facilitator_type()).map(|r| (r, f)))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, f)| f);

        Ok(Arc::clone(ranked.unwrap_or(&claimants[0])))
    }

    pub fn facilitate(
        &self,
        step_type: &str,
        ambiance: &Ambiance,
        parameters: &Value,
    ) -> Result<FacilitatorResponse> {
        self.resolve(step_type)?.facilitate(ambiance, parameters)
    }
}
