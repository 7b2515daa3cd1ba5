//! Persistence seams for node and plan executions.
//!
//! The engine only needs a versioned document store. Updates are
//! compare-and-swap on `version`: the caller passes the document it read, the
//! store rejects it with [`EngineError::VersionConflict`] when someone else
//! wrote in between, and bumps the version on success.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::node_execution::NodeExecution;
use super::plan_execution::PlanExecution;
use super::status::Status;
use crate::error::{EngineError, Result};

#[async_trait]
pub trait NodeExecutionRepository: Send + Sync {
    async fn insert(&self, node: NodeExecution) -> Result<NodeExecution>;

    async fn get(&self, id: &str) -> Result<NodeExecution>;

    /// Store `node` if the stored version still equals `node.version`.
    async fn update(&self, node: NodeExecution) -> Result<NodeExecution>;

    /// All node executions of a plan execution, in creation order.
    async fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;

    /// Direct children of a fan-out parent, in creation order.
    async fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    /// Drop every node execution of a plan execution. Returns how many were removed.
    async fn delete_by_plan_execution(&self, plan_execution_id: &str) -> Result<usize>;

    /// Every descendant of `parent_id`, breadth first, optionally filtered by status.
    async fn find_descendants(
        &self,
        parent_id: &str,
        statuses: Option<&[Status]>,
    ) -> Result<Vec<NodeExecution>> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([parent_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            for child in self.find_children(&id).await? {
                queue.push_back(child.id.clone());
                if statuses.map_or(true, |s| s.contains(&child.status)) {
                    found.push(child);
                }
            }
        }
        Ok(found)
    }

    /// Non-terminal nodes without non-terminal children.
    async fn find_active_leaves(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let nodes = self.find_by_plan_execution(plan_execution_id).await?;
        let active_parents: Vec<&str> = nodes
            .iter()
            .filter(|n| !n.is_terminal())
            .filter_map(|n| n.parent_id.as_deref())
            .collect();
        Ok(nodes
            .iter()
            .filter(|n| !n.is_terminal() && !active_parents.contains(&n.id.as_str()))
            .cloned()
            .collect())
    }
}

#[async_trait]
pub trait PlanExecutionRepository: Send + Sync {
    async fn insert(&self, plan_execution: PlanExecution) -> Result<PlanExecution>;

    async fn get(&self, id: &str) -> Result<PlanExecution>;

    /// Compare-and-swap on `version`, like [`NodeExecutionRepository::update`].
    async fn update(&self, plan_execution: PlanExecution) -> Result<PlanExecution>;

    async fn list(&self) -> Result<Vec<PlanExecution>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
struct NodeTable {
    rows: HashMap<String, (u64, NodeExecution)>,
    next_seq: u64,
}

/// In-memory node execution store.
#[derive(Default)]
pub struct InMemoryNodeExecutionRepository {
    table: RwLock<NodeTable>,
}

impl InMemoryNodeExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect_sorted<F>(&self, filter: F) -> Vec<NodeExecution>
    where
        F: Fn(&NodeExecution) -> bool,
    {
        let table = self.table.read();
        let mut rows: Vec<&(u64, NodeExecution)> =
            table.rows.values().filter(|(_, n)| filter(n)).collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, n)| n.clone()).collect()
    }
}

#[async_trait]
impl NodeExecutionRepository for InMemoryNodeExecutionRepository {
    async fn insert(&self, mut node: NodeExecution) -> Result<NodeExecution> {
        let mut table = self.table.write();
        if table.rows.contains_key(&node.id) {
            return Err(EngineError::CorruptState(format!(
                "node execution '{}' already exists",
                node.id
            )));
        }
        node.version = 1;
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(node.id.clone(), (seq, node.clone()));
        Ok(node)
    }

    async fn get(&self, id: &str) -> Result<NodeExecution> {
        self.table
            .read()
            .rows
            .get(id)
            .map(|(_, n)| n.clone())
            .ok_or_else(|| EngineError::NodeExecutionNotFound(id.to_string()))
    }

    async fn update(&self, mut node: NodeExecution) -> Result<NodeExecution> {
        let mut table = self.table.write();
        let (_, stored) = table
            .rows
            .get_mut(&node.id)
            .ok_or_else(|| EngineError::NodeExecutionNotFound(node.id.clone()))?;
        if stored.version != node.version {
            return Err(EngineError::VersionConflict {
                id: node.id.clone(),
                expected: node.version,
                actual: stored.version,
            });
        }
        node.version += 1;
        *stored = node.clone();
        Ok(node)
    }

    async fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self.collect_sorted(|n| n.plan_execution_id == plan_execution_id))
    }

    async fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self.collect_sorted(|n| n.parent_id.as_deref() == Some(parent_id)))
    }

    async fn delete_by_plan_execution(&self, plan_execution_id: &str) -> Result<usize> {
        let mut table = self.table.write();
        let before = table.rows.len();
        table
            .rows
            .retain(|_, (_, n)| n.plan_execution_id != plan_execution_id);
        Ok(before - table.rows.len())
    }
}

/// In-memory plan execution store.
#[derive(Default)]
pub struct InMemoryPlanExecutionRepository {
    rows: RwLock<HashMap<String, PlanExecution>>,
}

impl InMemoryPlanExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanExecutionRepository for InMemoryPlanExecutionRepository {
    async fn insert(&self, mut plan_execution: PlanExecution) -> Result<PlanExecution> {
        plan_execution.version = 1;
        self.rows
            .write()
            .insert(plan_execution.id.clone(), plan_execution.clone());
        Ok(plan_execution)
    }

    async fn get(&self, id: &str) -> Result<PlanExecution> {
        self.rows
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::PlanExecutionNotFound(id.to_string()))
    }

    async fn update(&self, mut plan_execution: PlanExecution) -> Result<PlanExecution> {
        let mut rows = self.rows.write();
        let stored = rows
            .get_mut(&plan_execution.id)
            .ok_or_else(|| EngineError::PlanExecutionNotFound(plan_execution.id.clone()))?;
        if stored.version != plan_execution.version {
            return Err(EngineError::VersionConflict {
                id: plan_execution.id.clone(),
                expected: plan_execution.version,
                actual: stored.version,
            });
        }
        plan_execution.version += 1;
        *stored = plan_execution.clone();
        Ok(plan_execution)
    }

    async fn list(&self) -> Result<Vec<PlanExecution>> {
        Ok(self.rows.read().values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.rows.write().remove(id);
        Ok(())
    }
}
