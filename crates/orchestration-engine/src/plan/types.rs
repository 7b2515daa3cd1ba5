//! Plan graph types.
//!
//! A plan is a read-only DAG of plan nodes. Nodes are wired by `next_node_id`
//! (sequential flow) and `child_node_ids` (fan-out); advisers may add further
//! edges such as retry, on-fail or rollback targets through their parameters.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Ambiance;
use crate::error::{EngineError, Result};

/// Unique identifier for a plan node.
pub type PlanNodeId = String;

/// Step type handled by the engine itself as a barrier rendezvous.
pub const BARRIER_STEP_TYPE: &str = "BARRIER";

/// Step parameter naming the barrier a BARRIER node participates in.
pub const BARRIER_REF_PARAM: &str = "barrierRef";

/// A plan: nodes plus the node execution starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub starting_node_id: PlanNodeId,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn new(id: impl Into<String>, starting_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            starting_node_id: starting_node_id.into(),
            nodes: Vec::new(),
        }
    }

    /// Find a node by its ID.
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Find a node by its ID, failing with `PlanNodeNotFound`.
    pub fn fetch_node(&self, node_id: &str) -> Result<&PlanNode> {
        self.node(node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(node_id.to_string()))
    }

    pub fn starting_node(&self) -> Option<&PlanNode> {
        self.node(&self.starting_node_id)
    }

    /// Validate the plan structure without registries.
    pub fn validate(&self) -> Result<()> {
        super::validation::validate_plan(self, None).into_result()
    }

    /// All BARRIER nodes, keyed by their barrier reference.
    pub fn barrier_participants(&self) -> HashMap<String, Vec<PlanNodeId>> {
        let mut barriers: HashMap<String, Vec<PlanNodeId>> = HashMap::new();
        for node in self.nodes.iter().filter(|n| n.is_barrier()) {
            if let Some(barrier_ref) = node.barrier_ref() {
                barriers
                    .entry(barrier_ref.to_string())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        barriers
    }

    /// BARRIER nodes met by following `next_node_id` from `root_id`, without
    /// descending into child branches.
    pub fn barriers_on_path(&self, root_id: &str) -> Vec<&PlanNode> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = self.node(root_id);
        while let Some(node) = cursor {
            if !visited.insert(node.id.as_str()) {
                break;
            }
            if node.is_barrier() {
                found.push(node);
            }
            cursor = node.next_node_id.as_deref().and_then(|id| self.node(id));
        }
        found
    }

    /// BARRIER nodes structurally reachable from `root_id` (following next and
    /// child edges), i.e. the barriers a branch starting at `root_id` will meet.
    pub fn barriers_in_branch(&self, root_id: &str) -> Vec<&PlanNode> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.node(id) else {
                continue;
            };
            if node.is_barrier() {
                found.push(node);
            }
            stack.extend(node.structural_targets());
        }
        found
    }
}

/// A node in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    pub step_type: String,
    /// Ambiance group for levels created from this node (e.g. "STAGE").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<PlanNodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_node_ids: Vec<PlanNodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adviser_obtainments: Vec<Obtainment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeout_obtainments: Vec<Obtainment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<SkipCondition>,
}

impl PlanNode {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            name: id.clone(),
            id,
            step_type: step_type.into(),
            group: None,
            step_parameters: Value::Null,
            next_node_id: None,
            child_node_ids: Vec::new(),
            adviser_obtainments: Vec::new(),
            timeout_obtainments: Vec::new(),
            skip_condition: None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.step_type == BARRIER_STEP_TYPE
    }

    pub fn barrier_ref(&self) -> Option<&str> {
        self.step_parameters
            .get(BARRIER_REF_PARAM)
            .and_then(Value::as_str)
    }

    /// Targets of next and child edges.
    pub fn structural_targets(&self) -> impl Iterator<Item = &str> {
        self.next_node_id
            .iter()
            .chain(self.child_node_ids.iter())
            .map(String::as_str)
    }
}

/// A reference to a registered adviser or timeout tracker, plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obtainment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
}

impl Obtainment {
    pub fn new(kind: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }
}

/// Condition under which a node is skipped instead of executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipCondition {
    Literal { value: bool },
    AbstractionEquals { key: String, value: String },
}

impl SkipCondition {
    /// A missing abstraction never matches.
    pub fn evaluate(&self, ambiance: &Ambiance) -> bool {
        match self {
            SkipCondition::Literal { value } => *value,
            SkipCondition::AbstractionEquals { key, value } => {
                ambiance.abstraction(key).map_or(false, |v| v == value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skip_condition() {
        let mut abstractions = HashMap::new();
        abstractions.insert("env".to_string(), "prod".to_string());
        let ambiance = Ambiance::new("pe", "plan", abstractions);

        assert!(SkipCondition::Literal { value: true }.evaluate(&ambiance));
        let cond = SkipCondition::AbstractionEquals {
            key: "env".into(),
            value: "prod".into(),
        };
        assert!(cond.evaluate(&ambiance));
        let missing = SkipCondition::AbstractionEquals {
            key: "region".into(),
            value: "eu".into(),
        };
        assert!(!missing.evaluate(&ambiance));
    }

    #[test]
    fn test_barriers_in_branch() {
        let mut plan = Plan::new("p", "fork");
        let mut fork = PlanNode::new("fork", "FORK");
        fork.child_node_ids = vec!["a".into(), "b".into()];
        let mut a = PlanNode::new("a", "SHELL");
        a.next_node_id = Some("wait-a".into());
        let mut wait_a = PlanNode::new("wait-a", BARRIER_STEP_TYPE);
        wait_a.step_parameters = json!({ "barrierRef": "B1" });
        let b = PlanNode::new("b", "SHELL");
        plan.nodes = vec![fork, a, wait_a, b];

        let in_a: Vec<&str> = plan.barriers_in_branch("a").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(in_a, vec!["wait-a"]);
        assert!(plan.barriers_in_branch("b").is_empty());
        assert_eq!(plan.barrier_participants()["B1"], vec!["wait-a"]);
    }

    #[test]
    fn test_obtainment_wire_name() {
        let obtainment = Obtainment::new("RETRY", json!({ "retryCount": 3 }));
        let json = serde_json::to_value(&obtainment).unwrap();
        assert_eq!(json["type"], "RETRY");
    }
}
