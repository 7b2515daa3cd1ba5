//! Adviser engine: decides what happens after a node reaches a decision point.
//!
//! Each plan node lists adviser obtainments in order. At the decision point the
//! engine walks them, skipping advisers whose `applicableFailureTypes` do not
//! intersect the failure, and the first adviser that returns an [`Advise`]
//! wins. The advise is stored on the node execution and applied once.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::execution::{FailureInfo, FailureType, Status};
use crate::interrupt::InterruptType;
use crate::plan::validation::ADVISER_NODE_REF_KEYS;
use crate::plan::Obtainment;

pub use builtin::{
    AbortAdviser, EndPlanAdviser, IgnoreAdviser, ManualInterventionAdviser, MarkSuccessAdviser,
    OnFailAdviser, OnSuccessAdviser, PauseAdviser, RepairActionCode, RetryAdviser,
    RetryParameters, RollbackAdviser,
};

/// Parameter listing the failure types an adviser applies to.
pub const APPLICABLE_FAILURE_TYPES_PARAM: &str = "applicableFailureTypes";

/// Outcome of a decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advise {
    /// Continue with `next_node_id`; `None` ends the branch.
    #[serde(rename_all = "camelCase")]
    NextStep { next_node_id: Option<String> },
    /// Run the same plan node again after the wait. `None` uses the engine default.
    #[serde(rename_all = "camelCase")]
    Retry { wait_ms: Option<u64> },
    /// Route a failure to another node.
    #[serde(rename_all = "camelCase")]
    OnFail { next_node_id: String },
    /// Treat the failure as IGNORE_FAILED and continue.
    #[serde(rename_all = "camelCase")]
    Ignore { next_node_id: Option<String> },
    Abort,
    Pause,
    Resume,
    /// Park the node until an operator acts; `timeout_action` fires after `timeout_ms`.
    #[serde(rename_all = "camelCase")]
    ManualIntervention {
        timeout_ms: Option<u64>,
        timeout_action: InterruptType,
    },
    /// Treat the failure as success and continue.
    #[serde(rename_all = "camelCase")]
    MarkSuccess { next_node_id: Option<String> },
    EndPlan,
    #[serde(rename_all = "camelCase")]
    Rollback { rollback_node_id: String },
}

impl Advise {
    pub fn name(&self) -> &'static str {
        match self {
            Advise::NextStep { .. } => "NEXT_STEP",
            Advise::Retry { .. } => "RETRY",
            Advise::OnFail { .. } => "ON_FAIL",
            Advise::Ignore { .. } => "IGNORE",
            Advise::Abort => "ABORT",
            Advise::Pause => "PAUSE",
            Advise::Resume => "RESUME",
            Advise::ManualIntervention { .. } => "MANUAL_INTERVENTION",
            Advise::MarkSuccess { .. } => "MARK_SUCCESS",
            Advise::EndPlan => "END_PLAN",
            Advise::Rollback { .. } => "ROLLBACK",
        }
    }
}

/// View of a node execution at its decision point.
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub node_execution_id: &'a str,
    pub plan_node_id: &'a str,
    pub status: Status,
    pub failure_info: Option<&'a FailureInfo>,
    /// Retries that preceded this execution of the plan node.
    pub retry_count: u32,
    /// The plan node's own `next_node_id`.
    pub next_node_id: Option<&'a str>,
    pub parameters: &'a Value,
}

impl<'a> AdvisingEvent<'a> {
    pub fn is_failure(&self) -> bool {
        self.status.is_broken()
    }

    pub fn with_parameters(mut self, parameters: &'a Value) -> Self {
        self.parameters = parameters;
        self
    }
}

pub trait Adviser: Send + Sync {
    fn adviser_type(&self) -> &str;

    /// Whether this adviser has anything to say about the event.
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.is_failure()
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>>;

    /// Plan nodes referenced by these parameters, for plan validation.
    fn referenced_nodes(&self, parameters: &Value) -> Result<Vec<String>> {
        Ok(ADVISER_NODE_REF_KEYS
            .iter()
            .filter_map(|key| parameters.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Reject parameters [`advise`](Self::advise) could not work with.
    fn validate_parameters(&self, _parameters: &Value) -> Result<()> {
        Ok(())
    }
}

/// Decode adviser parameters; `null` reads as an empty object.
pub(crate) fn parse_parameters<T: DeserializeOwned>(owner: &str, parameters: &Value) -> Result<T> {
    let value = if parameters.is_null() {
        Value::Object(Default::default())
    } else {
        parameters.clone()
    };
    serde_json::from_value(value).map_err(|e| EngineError::invalid_parameters(owner, e))
}

/// Failure types an obtainment is restricted to; empty means all.
fn applicable_failure_types(obtainment: &Obtainment) -> Result<Vec<FailureType>> {
    match obtainment.parameters.get(APPLICABLE_FAILURE_TYPES_PARAM) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| EngineError::invalid_parameters(obtainment.kind.as_str(), e)),
    }
}

/// Maps adviser type tags to implementations.
#[derive(Default)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adviser.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OnSuccessAdviser));
        registry.register(Arc::new(OnFailAdviser));
        registry.register(Arc::new(IgnoreAdviser));
        registry.register(Arc::new(RetryAdviser));
        registry.register(Arc::new(ManualInterventionAdviser));
        registry.register(Arc::new(AbortAdviser));
        registry.register(Arc::new(PauseAdviser));
        registry.register(Arc::new(MarkSuccessAdviser));
        registry.register(Arc::new(EndPlanAdviser));
        registry.register(Arc::new(RollbackAdviser));
        registry
    }

    /// Register an adviser under its own type. Replaces an existing one.
    pub fn register(&mut self, adviser: Arc<dyn Adviser>) {
        self.advisers
            .insert(adviser.adviser_type().to_string(), adviser);
    }

    pub fn get(&self, adviser_type: &str) -> Option<&Arc<dyn Adviser>> {
        self.advisers.get(adviser_type)
    }

    pub fn contains(&self, adviser_type: &str) -> bool {
        self.advisers.contains_key(adviser_type)
    }

    /// Check an obtainment's parameters ahead of any execution.
    pub fn validate_obtainment(&self, obtainment: &Obtainment) -> Result<()> {
        let adviser = self
            .get(&obtainment.kind)
            .ok_or_else(|| EngineError::UnknownAdviser(obtainment.kind.clone()))?;
        applicable_failure_types(obtainment)?;
        adviser.validate_parameters(&obtainment.parameters)
    }

    /// Walk `obtainments` in order and return the first advise with the
    /// type of the adviser that produced it.
    pub fn advise(
        &self,
        obtainments: &[Obtainment],
        event: &AdvisingEvent<'_>,
    ) -> Result<Option<(String, Advise)>> {
        for obtainment in obtainments {
            let adviser = self
                .get(&obtainment.kind)
                .ok_or_else(|| EngineError::UnknownAdviser(obtainment.kind.clone()))?;

            if let Some(failure) = event.failure_info {
                let applicable = applicable_failure_types(obtainment)?;
                if !applicable.is_empty()
                    && !failure.failure_types.iter().any(|t| applicable.contains(t))
                {
                    log::debug!(
                        "Skipping adviser '{}' on node '{}': failure types {:?} not applicable",
                        obtainment.kind,
                        event.node_execution_id,
                        failure.failure_types
                    );
                    continue;
                }
            }

            let event = event.with_parameters(&obtainment.parameters);
            if !adviser.can_advise(&event) {
                continue;
            }
            if let Some(advise) = adviser.advise(&event)? {
                log::debug!(
                    "Adviser '{}' advised {} for node '{}'",
                    obtainment.kind,
                    advise.name(),
                    event.node_execution_id
                );
                return Ok(Some((obtainment.kind.clone(), advise)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failed_event<'a>(failure: &'a FailureInfo, retry_count: u32) -> AdvisingEvent<'a> {
        AdvisingEvent {
            node_execution_id: "ne",
            plan_node_id: "deploy",
            status: Status::Failed,
            failure_info: Some(failure),
            retry_count,
            next_node_id: Some("verify"),
            parameters: &Value::Null,
        }
    }

    #[test]
    fn test_non_matching_failure_types_are_skipped() {
        let registry = AdviserRegistry::with_builtins();
        let obtainments = vec![
            Obtainment::new(
                "RETRY",
                json!({
                    "retryCount": 2,
                    "repairActionCode": "ABORT",
                    "applicableFailureTypes": ["CONNECTIVITY"]
                }),
            ),
            Obtainment::new("ON_FAIL", json!({ "nextNodeId": "cleanup" })),
        ];

        let failure = FailureInfo::new("bad manifest", FailureType::ApplicationError);
        let (adviser, advise) = registry
            .advise(&obtainments, &failed_event(&failure, 0))
            .unwrap()
            .unwrap();
        assert_eq!(adviser, "ON_FAIL");
        assert_eq!(
            advise,
            Advise::OnFail {
                next_node_id: "cleanup".into()
            }
        );

        let transient = FailureInfo::new("timeout talking to cluster", FailureType::Connectivity);
        let (adviser, _) = registry
            .advise(&obtainments, &failed_event(&transient, 0))
            .unwrap()
            .unwrap();
        assert_eq!(adviser, "RETRY");
    }

    #[test]
    fn test_validate_obtainment() {
        let registry = AdviserRegistry::with_builtins();
        let valid = Obtainment::new("MANUAL_INTERVENTION", json!({"timeoutMs": 1000}));
        assert!(registry.validate_obtainment(&valid).is_ok());

        for (kind, parameters) in [
            ("MANUAL_INTERVENTION", json!({"timeoutAction": "EXPLODE"})),
            ("IGNORE", json!({"nextNodeId": 7})),
            ("RETRY", json!({"retryCount": 1, "applicableFailureTypes": ["SOLAR_FLARE"]})),
        ] {
            assert!(
                matches!(
                    registry.validate_obtainment(&Obtainment::new(kind, parameters)),
                    Err(EngineError::InvalidParameters { .. })
                ),
                "{} accepted bad parameters",
                kind
            );
        }
        assert!(matches!(
            registry.validate_obtainment(&Obtainment::new("TELEPATHY", json!({}))),
            Err(EngineError::UnknownAdviser(_))
        ));
    }

    #[test]
    fn test_unknown_adviser_errors() {
        let registry = AdviserRegistry::with_builtins();
        let failure = FailureInfo::new("x", FailureType::Unknown);
        let err = registry
            .advise(&[Obtainment::new("NOPE", json!({}))], &failed_event(&failure, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAdviser(t) if t == "NOPE"));
    }

    #[test]
    fn test_no_advise_for_success_without_on_success() {
        let registry = AdviserRegistry::with_builtins();
        let event = AdvisingEvent {
            node_execution_id: "ne",
            plan_node_id: "build",
            status: Status::Succeeded,
            failure_info: None,
            retry_count: 0,
            next_node_id: None,
            parameters: &Value::Null,
        };
        let obtainments = vec![Obtainment::new("ON_FAIL", json!({ "nextNodeId": "x" }))];
        assert!(registry.advise(&obtainments, &event).unwrap().is_none());
    }

    #[test]
    fn test_advise_serialization() {
        let advise = Advise::ManualIntervention {
            timeout_ms: Some(60_000),
            timeout_action: InterruptType::MarkExpired,
        };
        let json = serde_json::to_value(&advise).unwrap();
        assert_eq!(json["type"], "MANUAL_INTERVENTION");
        assert_eq!(json["timeoutAction"], "MARK_EXPIRED");
    }
}
