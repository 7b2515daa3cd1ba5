//! Plan validation
//!
//! Validates plan structure, node references and registry coverage, and
//! detects cycles. All problems are collected, not just the first.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Obtainment, Plan};
use crate::adviser::AdviserRegistry;
use crate::error::{EngineError, Result};
use crate::facilitator::FacilitatorRegistry;
use crate::timeout::TimeoutTrackerRegistry;

/// Parameter keys through which adviser obtainments reference other nodes.
pub const ADVISER_NODE_REF_KEYS: [&str; 2] = ["nextNodeId", "rollbackNodeId"];

/// Registries a plan is checked against when they are available.
pub struct PlanRegistries<'a> {
    pub facilitators: &'a FacilitatorRegistry,
    pub advisers: &'a AdviserRegistry,
    pub timeout_trackers: &'a TimeoutTrackerRegistry,
}

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Cycle over next/child edges
    CycleDetected,
    /// Two nodes share an id
    DuplicateNodeId { node_id: String },
    /// The plan names no starting node
    MissingStartingNode,
    /// The starting node id does not resolve
    UnknownStartingNode { node_id: String },
    /// A node other than the starting node has no incoming edge
    ExtraRootNode { node_id: String },
    /// A next, child or adviser reference does not resolve
    UnresolvedReference {
        node_id: String,
        kind: &'static str,
        target: String,
    },
    /// A node cannot be reached from the starting node
    UnreachableNode { node_id: String },
    /// A BARRIER node has no barrier reference
    MissingBarrierRef { node_id: String },
    /// Adviser type not registered
    UnknownAdviserType { node_id: String, adviser_type: String },
    /// Adviser parameters could not be decoded
    InvalidAdviserParameters {
        node_id: String,
        adviser_type: String,
        message: String,
    },
    /// Timeout tracker type not registered
    UnknownTimeoutTracker { node_id: String, tracker_type: String },
    /// The tracker rejected its parameters
    InvalidTimeoutParameters {
        node_id: String,
        tracker_type: String,
        message: String,
    },
    /// No facilitator claims the node's step type
    NoFacilitator { node_id: String, step_type: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleDetected => write!(f, "Cycle detected in plan"),
            Self::DuplicateNodeId { node_id } => write!(f, "Duplicate node id '{}'", node_id),
            Self::MissingStartingNode => write!(f, "Plan has no starting node"),
            Self::UnknownStartingNode { node_id } => {
                write!(f, "Starting node '{}' does not exist", node_id)
            }
            Self::ExtraRootNode { node_id } => {
                write!(f, "Node '{}' has no incoming edge but is not the starting node", node_id)
            }
            Self::UnresolvedReference {
                node_id,
                kind,
                target,
            } => write!(
                f,
                "Node '{}' has {} reference to unknown node '{}'",
                node_id, kind, target
            ),
            Self::UnreachableNode { node_id } => {
                write!(f, "Node '{}' is unreachable from the starting node", node_id)
            }
            Self::MissingBarrierRef { node_id } => {
                write!(f, "Barrier node '{}' has no barrierRef", node_id)
            }
            Self::UnknownAdviserType {
                node_id,
                adviser_type,
            } => write!(f, "Unknown adviser type '{}' on node '{}'", adviser_type, node_id),
            Self::InvalidAdviserParameters {
                node_id,
                adviser_type,
                message,
            } => write!(
                f,
                "Invalid parameters for adviser '{}' on node '{}': {}",
                adviser_type, node_id, message
            ),
            Self::UnknownTimeoutTracker {
                node_id,
                tracker_type,
            } => write!(
                f,
                "Unknown timeout tracker '{}' on node '{}'",
                tracker_type, node_id
            ),
            Self::InvalidTimeoutParameters {
                node_id,
                tracker_type,
                message,
            } => write!(
                f,
                "Invalid parameters for timeout tracker '{}' on node '{}': {}",
                tracker_type, node_id, message
            ),
            Self::NoFacilitator { node_id, step_type } => write!(
                f,
                "No facilitator for step type '{}' on node '{}'",
                step_type, node_id
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Non-fatal findings.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    /// Several facilitators claim a step type and no precedence entry decides
    AmbiguousFacilitator {
        step_type: String,
        facilitators: Vec<String>,
    },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousFacilitator {
                step_type,
                facilitators,
            } => write!(
                f,
                "Step type '{}' is claimed by several facilitators ({}); first registered wins",
                step_type,
                facilitators.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log warnings and turn errors into `InvalidPlan`.
    pub fn into_result(self) -> Result<()> {
        for warning in &self.warnings {
            log::warn!("Plan validation: {}", warning);
        }
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidPlan(self.errors))
        }
    }
}

/// Validate a plan
///
/// Returns all findings. Pass registries to also check adviser, timeout
/// tracker and facilitator coverage.
pub fn validate_plan(plan: &Plan, registries: Option<&PlanRegistries<'_>>) -> ValidationReport {
    let mut report = ValidationReport::default();

    validate_unique_ids(plan, &mut report.errors);
    validate_starting_node(plan, &mut report.errors);
    validate_references(plan, registries, &mut report.errors);
    validate_reachability(plan, registries, &mut report.errors);
    detect_cycles(plan, &mut report.errors);
    validate_barriers(plan, &mut report.errors);

    if let Some(registries) = registries {
        validate_registry_coverage(plan, registries, &mut report);
    }

    report
}

/// Node ids referenced by an adviser obtainment.
fn adviser_targets(
    obtainment: &Obtainment,
    registries: Option<&PlanRegistries<'_>>,
) -> std::result::Result<Vec<String>, String> {
    if let Some(adviser) = registries.and_then(|r| r.advisers.get(&obtainment.kind)) {
        return adviser
            .referenced_nodes(&obtainment.parameters)
            .map_err(|e| e.to_string());
    }
    Ok(ADVISER_NODE_REF_KEYS
        .iter()
        .filter_map(|key| obtainment.parameters.get(*key))
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect())
}

/// Every outgoing edge of every node, structural and adviser-derived.
fn all_edges<'a>(
    plan: &'a Plan,
    registries: Option<&PlanRegistries<'_>>,
) -> Vec<(&'a str, String)> {
    let mut edges = Vec::new();
    for node in &plan.nodes {
        for target in node.structural_targets() {
            edges.push((node.id.as_str(), target.to_string()));
        }
        for obtainment in &node.adviser_obtainments {
            if let Ok(targets) = adviser_targets(obtainment, registries) {
                edges.extend(targets.into_iter().map(|t| (node.id.as_str(), t)));
            }
        }
    }
    edges
}

fn validate_unique_ids(plan: &Plan, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &plan.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }
}

fn validate_starting_node(plan: &Plan, errors: &mut Vec<ValidationError>) {
    if plan.starting_node_id.is_empty() {
        errors.push(ValidationError::MissingStartingNode);
    } else if plan.starting_node().is_none() {
        errors.push(ValidationError::UnknownStartingNode {
            node_id: plan.starting_node_id.clone(),
        });
    }
}

fn validate_references(
    plan: &Plan,
    registries: Option<&PlanRegistries<'_>>,
    errors: &mut Vec<ValidationError>,
) {
    let node_ids: HashSet<&str> = plan.nodes.iter().map(|n| n.id.as_str()).collect();
    let unresolved = |node_id: &str, kind: &'static str, target: &str| {
        (!node_ids.contains(target)).then(|| ValidationError::UnresolvedReference {
            node_id: node_id.to_string(),
            kind,
            target: target.to_string(),
        })
    };

    for node in &plan.nodes {
        if let Some(next) = &node.next_node_id {
            errors.extend(unresolved(&node.id, "next", next));
        }
        for child in &node.child_node_ids {
            errors.extend(unresolved(&node.id, "child", child));
        }
        for obtainment in &node.adviser_obtainments {
            match adviser_targets(obtainment, registries) {
                Ok(targets) => {
                    for target in targets {
                        errors.extend(unresolved(&node.id, "adviser", &target));
                    }
                }
                Err(message) => errors.push(ValidationError::InvalidAdviserParameters {
                    node_id: node.id.clone(),
                    adviser_type: obtainment.kind.clone(),
                    message,
                }),
            }
        }
    }
}

/// BFS from the starting node over every edge kind
fn validate_reachability(
    plan: &Plan,
    registries: Option<&PlanRegistries<'_>>,
    errors: &mut Vec<ValidationError>,
) {
    if plan.starting_node().is_none() {
        return;
    }
    let edges = all_edges(plan, registries);

    let mut incoming: HashSet<&str> = HashSet::new();
    for (_, target) in &edges {
        incoming.insert(target.as_str());
    }
    for node in &plan.nodes {
        if node.id != plan.starting_node_id && !incoming.contains(node.id.as_str()) {
            errors.push(ValidationError::ExtraRootNode {
                node_id: node.id.clone(),
            });
        }
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (source, target) in &edges {
        adjacency.entry(*source).or_default().push(target.as_str());
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([plan.starting_node_id.as_str()]);
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if let Some(targets) = adjacency.get(id) {
            queue.extend(targets.iter().copied());
        }
    }

    for node in &plan.nodes {
        if !visited.contains(node.id.as_str()) {
            errors.push(ValidationError::UnreachableNode {
                node_id: node.id.clone(),
            });
        }
    }
}

/// Detect cycles over next/child edges using Kahn's algorithm.
///
/// Adviser-derived edges (retry, on-fail, rollback) are allowed to point back.
fn detect_cycles(plan: &Plan, errors: &mut Vec<ValidationError>) {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for node in &plan.nodes {
        in_degree.insert(&node.id, 0);
    }
    for node in &plan.nodes {
        for target in node.structural_targets() {
            if let Some(deg) = in_degree.get_mut(target) {
                *deg += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited = 0;
    while let Some(node_id) = queue.pop_front() {
        visited += 1;
        let Some(node) = plan.node(node_id) else {
            continue;
        };
        for target in node.structural_targets() {
            if let Some(deg) = in_degree.get_mut(target) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    if visited < in_degree.len() {
        errors.push(ValidationError::CycleDetected);
    }
}

fn validate_barriers(plan: &Plan, errors: &mut Vec<ValidationError>) {
    for node in plan.nodes.iter().filter(|n| n.is_barrier()) {
        if node.barrier_ref().map_or(true, str::is_empty) {
            errors.push(ValidationError::MissingBarrierRef {
                node_id: node.id.clone(),
            });
        }
    }
}

fn validate_registry_coverage(
    plan: &Plan,
    registries: &PlanRegistries<'_>,
    report: &mut ValidationReport,
) {
    let mut warned: HashSet<&str> = HashSet::new();
    for node in &plan.nodes {
        for obtainment in &node.adviser_obtainments {
            if !registries.advisers.contains(&obtainment.kind) {
                report.errors.push(ValidationError::UnknownAdviserType {
                    node_id: node.id.clone(),
                    adviser_type: obtainment.kind.clone(),
                });
                continue;
            }
            if let Err(e) = registries.advisers.validate_obtainment(obtainment) {
                let error = ValidationError::InvalidAdviserParameters {
                    node_id: node.id.clone(),
                    adviser_type: obtainment.kind.clone(),
                    message: e.to_string(),
                };
                // Reference checks may already have reported the same decode error.
                if !report.errors.contains(&error) {
                    report.errors.push(error);
                }
            }
        }
        for obtainment in &node.timeout_obtainments {
            if !registries.timeout_trackers.contains(&obtainment.kind) {
                report.errors.push(ValidationError::UnknownTimeoutTracker {
                    node_id: node.id.clone(),
                    tracker_type: obtainment.kind.clone(),
                });
                continue;
            }
            if let Err(e) = registries
                .timeout_trackers
                .create(&obtainment.kind, &obtainment.parameters)
            {
                report.errors.push(ValidationError::InvalidTimeoutParameters {
                    node_id: node.id.clone(),
                    tracker_type: obtainment.kind.clone(),
                    message: e.to_string(),
                });
            }
        }

        let claimants = registries.facilitators.facilitators_for(&node.step_type);
        if claimants.is_empty() {
            report.errors.push(ValidationError::NoFacilitator {
                node_id: node.id.clone(),
                step_type: node.step_type.clone(),
            });
        } else if registries.facilitators.is_ambiguous(&node.step_type)
            && warned.insert(node.step_type.as_str())
        {
            report.warnings.push(ValidationWarning::AmbiguousFacilitator {
                step_type: node.step_type.clone(),
                facilitators: claimants,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionMode;
    use crate::facilitator::ModeFacilitator;
    use crate::plan::PlanBuilder;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_valid_plan() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .then("b")
            .add_node("b", "SHELL")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.is_valid(), "Expected no errors, got: {:?}", report.errors);
    }

    #[test]
    fn test_detect_structural_cycle() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .then("b")
            .add_node("b", "SHELL")
            .then("a")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.errors.contains(&ValidationError::CycleDetected));
    }

    #[test]
    fn test_adviser_back_edge_is_not_a_cycle() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .then("b")
            .add_node("b", "SHELL")
            .with_adviser("ON_FAIL", json!({"nextNodeId": "a"}))
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_rollback_target_reachable_via_adviser() {
        let plan = PlanBuilder::new("p")
            .add_node("deploy", "SHELL")
            .with_adviser(
                "RETRY",
                json!({"retryCount": 1, "repairActionCode": "ROLLBACK", "rollbackNodeId": "undo"}),
            )
            .add_node("undo", "SHELL")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_unreachable_and_extra_root() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .add_node("orphan", "SHELL")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.errors.contains(&ValidationError::UnreachableNode {
            node_id: "orphan".into()
        }));
        assert!(report.errors.contains(&ValidationError::ExtraRootNode {
            node_id: "orphan".into()
        }));
    }

    #[test]
    fn test_missing_and_unknown_starting_node() {
        let plan = Plan::new("p", "");
        assert!(validate_plan(&plan, None)
            .errors
            .contains(&ValidationError::MissingStartingNode));

        let plan = PlanBuilder::new("p")
            .starting_node("nope")
            .add_node("a", "SHELL")
            .build();
        assert!(validate_plan(&plan, None)
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownStartingNode { .. })));
    }

    #[test]
    fn test_unresolved_child_reference() {
        let plan = PlanBuilder::new("p")
            .add_node("fork", "FORK")
            .with_children(["a", "ghost"])
            .add_node("a", "SHELL")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::UnresolvedReference { kind: "child", target, .. } if target == "ghost"
        )));
    }

    #[test]
    fn test_barrier_without_ref() {
        let plan = PlanBuilder::new("p")
            .add_node("wait", crate::plan::BARRIER_STEP_TYPE)
            .build();
        assert!(validate_plan(&plan, None)
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::MissingBarrierRef { .. })));
    }

    #[test]
    fn test_registry_coverage() {
        let mut facilitators = FacilitatorRegistry::new();
        facilitators.register("SHELL", Arc::new(ModeFacilitator::new("TASK", ExecutionMode::Task)));
        facilitators.register("SHELL", Arc::new(ModeFacilitator::new("SYNC", ExecutionMode::Sync)));
        let advisers = AdviserRegistry::with_builtins();
        let timeout_trackers = TimeoutTrackerRegistry::with_builtins();
        let registries = PlanRegistries {
            facilitators: &facilitators,
            advisers: &advisers,
            timeout_trackers: &timeout_trackers,
        };

        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .with_adviser("TELEPATHY", json!({}))
            .with_timeout("LUNAR", json!({}))
            .then("b")
            .add_node("b", "HTTP")
            .build();

        let report = validate_plan(&plan, Some(&registries));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownAdviserType { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::UnknownTimeoutTracker { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::NoFacilitator { step_type, .. } if step_type == "HTTP")));
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::AmbiguousFacilitator {
                step_type: "SHELL".into(),
                facilitators: vec!["TASK".into(), "SYNC".into()],
            }]
        );
    }

    #[test]
    fn test_obtainment_parameters_are_checked() {
        let mut facilitators = FacilitatorRegistry::new();
        facilitators.register("SHELL", Arc::new(ModeFacilitator::new("SYNC", ExecutionMode::Sync)));
        let advisers = AdviserRegistry::with_builtins();
        let timeout_trackers = TimeoutTrackerRegistry::with_builtins();
        let registries = PlanRegistries {
            facilitators: &facilitators,
            advisers: &advisers,
            timeout_trackers: &timeout_trackers,
        };

        let plan = PlanBuilder::new("p")
            .add_node("deploy", "SHELL")
            .with_timeout("ABSOLUTE", json!({}))
            .with_timeout("ACTIVE", json!({"timeoutMs": 5000}))
            .with_adviser("RETRY", json!({"retryCount": 2, "repairActionCode": "ROLLBACK"}))
            .with_adviser("MANUAL_INTERVENTION", json!({"timeoutAction": "EXPLODE"}))
            .build();

        let report = validate_plan(&plan, Some(&registries));
        let timeout_errors: Vec<&ValidationError> = report
            .errors
            .iter()
            .filter(|e| matches!(e, ValidationError::InvalidTimeoutParameters { .. }))
            .collect();
        assert_eq!(timeout_errors.len(), 1);
        assert!(matches!(
            timeout_errors[0],
            ValidationError::InvalidTimeoutParameters { tracker_type, .. } if tracker_type == "ABSOLUTE"
        ));

        let adviser_errors: Vec<&str> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::InvalidAdviserParameters { adviser_type, .. } => {
                    Some(adviser_type.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(adviser_errors, vec!["RETRY", "MANUAL_INTERVENTION"]);
        assert!(matches!(
            report.into_result(),
            Err(EngineError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_collects_multiple_errors() {
        let plan = PlanBuilder::new("p")
            .add_node("a", "SHELL")
            .then("a")
            .add_node("a", "SHELL")
            .build();
        let report = validate_plan(&plan, None);
        assert!(report.errors.len() >= 2);
        assert!(matches!(
            report.into_result(),
            Err(EngineError::InvalidPlan(_))
        ));
    }
}
