//! Fluent builder for plans
//!
//! Provides a fluent API for constructing plans programmatically.

use serde_json::Value;

use super::types::{Obtainment, Plan, PlanNode, SkipCondition, BARRIER_REF_PARAM, BARRIER_STEP_TYPE};
use super::validation::{validate_plan, PlanRegistries};
use crate::error::Result;

/// Fluent builder for constructing plans
///
/// `with_*` methods apply to the most recently added node. The first node added
/// is the starting node unless `starting_node` says otherwise.
///
/// # Example
///
/// ```ignore
/// let plan = PlanBuilder::new("deploy")
///     .add_node("build", "SHELL")
///     .with_parameters(serde_json::json!({"script": "make"}))
///     .then("deploy")
///     .add_node("deploy", "K8S_APPLY")
///     .with_adviser("RETRY", serde_json::json!({"retryCount": 3}))
///     .build();
/// ```
pub struct PlanBuilder {
    id: String,
    name: String,
    starting_node_id: Option<String>,
    nodes: Vec<PlanNode>,
}

impl PlanBuilder {
    /// Create a new plan builder
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            starting_node_id: None,
            nodes: Vec::new(),
        }
    }

    /// Set the plan name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the starting node
    pub fn starting_node(mut self, node_id: impl Into<String>) -> Self {
        self.starting_node_id = Some(node_id.into());
        self
    }

    /// Add a node to the plan
    pub fn add_node(mut self, id: impl Into<String>, step_type: impl Into<String>) -> Self {
        self.nodes.push(PlanNode::new(id, step_type));
        self
    }

    /// Add a barrier participant node
    pub fn add_barrier(self, id: impl Into<String>, barrier_ref: impl Into<String>) -> Self {
        let barrier_ref: String = barrier_ref.into();
        self.add_node(id, BARRIER_STEP_TYPE)
            .with_parameters(serde_json::json!({ BARRIER_REF_PARAM: barrier_ref }))
    }

    fn last(&mut self) -> Option<&mut PlanNode> {
        self.nodes.last_mut()
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        if let Some(node) = self.last() {
            node.identifier = identifier.into();
        }
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        if let Some(node) = self.last() {
            node.group = Some(group.into());
        }
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Some(node) = self.last() {
            node.step_parameters = parameters;
        }
        self
    }

    /// Set the next node of the most recently added node
    pub fn then(mut self, next_node_id: impl Into<String>) -> Self {
        if let Some(node) = self.last() {
            node.next_node_id = Some(next_node_id.into());
        }
        self
    }

    /// Set the fan-out children of the most recently added node
    pub fn with_children<I, S>(mut self, child_node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(node) = self.last() {
            node.child_node_ids = child_node_ids.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_adviser(mut self, adviser_type: impl Into<String>, parameters: Value) -> Self {
        if let Some(node) = self.last() {
            node.adviser_obtainments
                .push(Obtainment::new(adviser_type, parameters));
        }
        self
    }

    pub fn with_timeout(mut self, tracker_type: impl Into<String>, parameters: Value) -> Self {
        if let Some(node) = self.last() {
            node.timeout_obtainments
                .push(Obtainment::new(tracker_type, parameters));
        }
        self
    }

    pub fn with_skip_condition(mut self, condition: SkipCondition) -> Self {
        if let Some(node) = self.last() {
            node.skip_condition = Some(condition);
        }
        self
    }

    /// Wire `source` to `target` as its next node
    pub fn connect(mut self, source: &str, target: impl Into<String>) -> Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == source) {
            node.next_node_id = Some(target.into());
        }
        self
    }

    /// Build the plan without validation
    pub fn build(self) -> Plan {
        let starting_node_id = self
            .starting_node_id
            .or_else(|| self.nodes.first().map(|n| n.id.clone()))
            .unwrap_or_default();
        let mut plan = Plan::new(self.id, starting_node_id);
        plan.name = self.name;
        plan.nodes = self.nodes;
        plan
    }

    /// Build and validate the plan
    pub fn build_validated(self, registries: Option<&PlanRegistries<'_>>) -> Result<Plan> {
        let plan = self.build();
        validate_plan(&plan, registries).into_result()?;
        Ok(plan)
    }
}
