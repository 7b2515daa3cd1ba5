//! Built-in advisers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_parameters, Adviser, Advise, AdvisingEvent};
use crate::error::{EngineError, Result};
use crate::execution::FailureType;
use crate::interrupt::InterruptType;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextNodeParameters {
    #[serde(default)]
    next_node_id: Option<String>,
}

impl NextNodeParameters {
    /// Explicit target, else the plan node's own next node.
    fn target(self, event: &AdvisingEvent<'_>) -> Option<String> {
        self.next_node_id
            .or_else(|| event.next_node_id.map(str::to_string))
    }
}

/// Routes successful nodes; `nextNodeId` overrides the plan wiring.
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn adviser_type(&self) -> &str {
        "ON_SUCCESS"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<NextNodeParameters>(self.adviser_type(), parameters).map(|_| ())
    }

    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        !event.is_failure()
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: NextNodeParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::NextStep {
            next_node_id: params.target(event),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnFailParameters {
    next_node_id: String,
}

/// Routes failures to a dedicated node.
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn adviser_type(&self) -> &str {
        "ON_FAIL"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<OnFailParameters>(self.adviser_type(), parameters).map(|_| ())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: OnFailParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::OnFail {
            next_node_id: params.next_node_id,
        }))
    }

    fn referenced_nodes(&self, parameters: &Value) -> Result<Vec<String>> {
        let params: OnFailParameters = parse_parameters(self.adviser_type(), parameters)?;
        Ok(vec![params.next_node_id])
    }
}

pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn adviser_type(&self) -> &str {
        "IGNORE"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<NextNodeParameters>(self.adviser_type(), parameters).map(|_| ())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: NextNodeParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::Ignore {
            next_node_id: params.target(event),
        }))
    }
}

pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn adviser_type(&self) -> &str {
        "MARK_SUCCESS"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<NextNodeParameters>(self.adviser_type(), parameters).map(|_| ())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: NextNodeParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::MarkSuccess {
            next_node_id: params.target(event),
        }))
    }
}

pub struct AbortAdviser;

impl Adviser for AbortAdviser {
    fn adviser_type(&self) -> &str {
        "ABORT"
    }

    fn advise(&self, _event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        Ok(Some(Advise::Abort))
    }
}

pub struct PauseAdviser;

impl Adviser for PauseAdviser {
    fn adviser_type(&self) -> &str {
        "PAUSE"
    }

    fn advise(&self, _event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        Ok(Some(Advise::Pause))
    }
}

pub struct EndPlanAdviser;

impl Adviser for EndPlanAdviser {
    fn adviser_type(&self) -> &str {
        "END_PLAN"
    }

    fn advise(&self, _event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        Ok(Some(Advise::EndPlan))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackParameters {
    rollback_node_id: String,
}

pub struct RollbackAdviser;

impl Adviser for RollbackAdviser {
    fn adviser_type(&self) -> &str {
        "ROLLBACK"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<RollbackParameters>(self.adviser_type(), parameters).map(|_| ())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: RollbackParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::Rollback {
            rollback_node_id: params.rollback_node_id,
        }))
    }

    fn referenced_nodes(&self, parameters: &Value) -> Result<Vec<String>> {
        let params: RollbackParameters = parse_parameters(self.adviser_type(), parameters)?;
        Ok(vec![params.rollback_node_id])
    }
}

fn default_timeout_action() -> InterruptType {
    InterruptType::MarkExpired
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualInterventionParameters {
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default = "default_timeout_action")]
    timeout_action: InterruptType,
}

/// Parks failed nodes until an operator intervenes.
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn adviser_type(&self) -> &str {
        "MANUAL_INTERVENTION"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        parse_parameters::<ManualInterventionParameters>(self.adviser_type(), parameters)
            .map(|_| ())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: ManualInterventionParameters =
            parse_parameters(self.adviser_type(), event.parameters)?;
        Ok(Some(Advise::ManualIntervention {
            timeout_ms: params.timeout_ms,
            timeout_action: params.timeout_action,
        }))
    }
}

/// What a retry adviser does once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairActionCode {
    ManualIntervention,
    Rollback,
    OnFail,
    Ignore,
    MarkSuccess,
    EndExecution,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryParameters {
    /// Maximum number of retries.
    pub retry_count: u32,
    /// Wait before each retry; the last entry repeats.
    #[serde(default)]
    pub wait_intervals_secs: Vec<u64>,
    pub repair_action_code: RepairActionCode,
    #[serde(default)]
    pub next_node_id: Option<String>,
    #[serde(default)]
    pub rollback_node_id: Option<String>,
    #[serde(default)]
    pub applicable_failure_types: Vec<FailureType>,
    /// Manual intervention timeout when the repair action parks the node.
    #[serde(default)]
    pub intervention_timeout_ms: Option<u64>,
    #[serde(default = "default_timeout_action")]
    pub intervention_timeout_action: InterruptType,
}

impl RetryParameters {
    fn validate(&self, owner: &str) -> Result<()> {
        let missing = match self.repair_action_code {
            RepairActionCode::Rollback if self.rollback_node_id.is_none() => Some("rollbackNodeId"),
            RepairActionCode::OnFail if self.next_node_id.is_none() => Some("nextNodeId"),
            _ => None,
        };
        match missing {
            Some(field) => Err(EngineError::invalid_parameters(
                owner,
                format!("{:?} repair action requires {}", self.repair_action_code, field),
            )),
            None => Ok(()),
        }
    }

    /// Wait before retry number `attempt` (zero based), in milliseconds.
    fn wait_ms(&self, attempt: u32) -> Option<u64> {
        let last = self.wait_intervals_secs.len().checked_sub(1)?;
        let index = (attempt as usize).min(last);
        Some(self.wait_intervals_secs[index].saturating_mul(1000))
    }
}

/// Retries failed nodes a bounded number of times, then applies its repair action.
pub struct RetryAdviser;

impl RetryAdviser {
    fn repair(params: RetryParameters, event: &AdvisingEvent<'_>) -> Advise {
        match params.repair_action_code {
            RepairActionCode::ManualIntervention => Advise::ManualIntervention {
                timeout_ms: params.intervention_timeout_ms,
                timeout_action: params.intervention_timeout_action,
            },
            RepairActionCode::Rollback => Advise::Rollback {
                rollback_node_id: params.rollback_node_id.unwrap_or_default(),
            },
            RepairActionCode::OnFail => Advise::OnFail {
                next_node_id: params.next_node_id.unwrap_or_default(),
            },
            RepairActionCode::Ignore => Advise::Ignore {
                next_node_id: params
                    .next_node_id
                    .or_else(|| event.next_node_id.map(str::to_string)),
            },
            RepairActionCode::MarkSuccess => Advise::MarkSuccess {
                next_node_id: params
                    .next_node_id
                    .or_else(|| event.next_node_id.map(str::to_string)),
            },
            RepairActionCode::EndExecution => Advise::EndPlan,
            RepairActionCode::Abort => Advise::Abort,
        }
    }
}

impl Adviser for RetryAdviser {
    fn adviser_type(&self) -> &str {
        "RETRY"
    }

    fn validate_parameters(&self, parameters: &Value) -> Result<()> {
        let params: RetryParameters = parse_parameters(self.adviser_type(), parameters)?;
        params.validate(self.adviser_type())
    }

    fn advise(&self, event: &AdvisingEvent<'_>) -> Result<Option<Advise>> {
        let params: RetryParameters = parse_parameters(self.adviser_type(), event.parameters)?;
        params.validate(self.adviser_type())?;

        if event.retry_count < params.retry_count {
            return Ok(Some(Advise::Retry {
                wait_ms: params.wait_ms(event.retry_count),
            }));
        }
        log::info!(
            "Retries exhausted for node '{}' after {} attempts, applying {:?}",
            event.plan_node_id,
            event.retry_count,
            params.repair_action_code
        );
        Ok(Some(Self::repair(params, event)))
    }

    fn referenced_nodes(&self, parameters: &Value) -> Result<Vec<String>> {
        let params: RetryParameters = parse_parameters(self.adviser_type(), parameters)?;
        params.validate(self.adviser_type())?;
        Ok(params
            .next_node_id
            .into_iter()
            .chain(params.rollback_node_id)
            .collect())
    }
}
