//! Execution context carried through every node of a plan execution.
//!
//! An [`Ambiance`] is an immutable stack of [`Level`]s plus a flat map of setup
//! abstractions (account, org, project, ...). Pushing or popping a level
//! returns a new ambiance; the unchanged prefix is shared through `Arc`, so
//! sibling branches each hold their own copy without cloning the whole stack.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Well-known setup abstraction keys.
pub mod abstraction_keys {
    pub const ACCOUNT_ID: &str = "accountId";
    pub const ORG_IDENTIFIER: &str = "orgIdentifier";
    pub const PROJECT_IDENTIFIER: &str = "projectIdentifier";
}

/// One frame of the ambiance stack, describing a node in the execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Plan node id this level was created for.
    pub setup_id: String,
    /// Node execution id this level belongs to.
    pub runtime_id: String,
    /// Human-facing identifier of the plan node.
    pub identifier: String,
    /// Step type of the plan node.
    pub step_type: String,
    /// Optional grouping (e.g. "STAGE", "STEP_GROUP").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Position in the stack, assigned on push.
    #[serde(default)]
    pub order: usize,
    /// Start time in epoch milliseconds.
    #[serde(default)]
    pub start_ts: i64,
    /// Number of retries that preceded this node execution.
    #[serde(default)]
    pub retry_index: u32,
}

impl Level {
    pub fn new(
        setup_id: impl Into<String>,
        runtime_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id: runtime_id.into(),
            identifier: identifier.into(),
            step_type: step_type.into(),
            group: None,
            order: 0,
            start_ts: 0,
            retry_index: 0,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_start_ts(mut self, start_ts: i64) -> Self {
        self.start_ts = start_ts;
        self
    }

    pub fn with_retry_index(mut self, retry_index: u32) -> Self {
        self.retry_index = retry_index;
        self
    }
}

#[derive(Debug)]
struct LevelNode {
    level: Level,
    parent: Option<Arc<LevelNode>>,
    depth: usize,
}

/// Immutable, stack-structured execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "AmbianceSnapshot", from = "AmbianceSnapshot")]
pub struct Ambiance {
    plan_execution_id: String,
    plan_id: String,
    setup_abstractions: Arc<HashMap<String, String>>,
    head: Option<Arc<LevelNode>>,
}

impl Ambiance {
    /// Create a root ambiance with no levels.
    pub fn new(
        plan_execution_id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: HashMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            plan_id: plan_id.into(),
            setup_abstractions: Arc::new(setup_abstractions),
            head: None,
        }
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    /// Number of levels on the stack.
    pub fn depth(&self) -> usize {
        self.head.as_ref().map_or(0, |n| n.depth)
    }

    /// Return a new ambiance with `level` on top. `self` is left untouched.
    pub fn push_level(&self, mut level: Level) -> Ambiance {
        let depth = self.depth();
        level.order = depth;
        Ambiance {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            head: Some(Arc::new(LevelNode {
                level,
                parent: self.head.clone(),
                depth: depth + 1,
            })),
        }
    }

    /// Return a new ambiance without the top level. Popping an empty stack
    /// yields an equal empty ambiance.
    pub fn pop_level(&self) -> Ambiance {
        Ambiance {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            head: self.head.as_ref().and_then(|n| n.parent.clone()),
        }
    }

    /// Keep only the bottom `depth` levels.
    pub fn clone_to_depth(&self, depth: usize) -> Ambiance {
        let mut head = self.head.clone();
        while head.as_ref().map_or(false, |n| n.depth > depth) {
            head = head.and_then(|n| n.parent.clone());
        }
        Ambiance {
            plan_execution_id: self.plan_execution_id.clone(),
            plan_id: self.plan_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            head,
        }
    }

    /// Levels from the bottom of the stack to the top.
    pub fn levels(&self) -> Vec<&Level> {
        let mut levels: Vec<&Level> = self.iter_from_top().collect();
        levels.reverse();
        levels
    }

    fn iter_from_top(&self) -> impl Iterator<Item = &Level> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.parent.as_deref();
            Some(&node.level)
        })
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.head.as_ref().map(|n| &n.level)
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&str> {
        self.current_level().map(|l| l.step_type.as_str())
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Start timestamp of the top level. Fails on an empty stack.
    pub fn current_level_start_ts(&self) -> Result<i64> {
        self.current_level()
            .map(|l| l.start_ts)
            .ok_or(EngineError::EmptyAmbiance)
    }

    /// Runtime id of the level directly beneath the top.
    pub fn parent_runtime_id(&self) -> Option<&str> {
        self.iter_from_top().nth(1).map(|l| l.runtime_id.as_str())
    }

    /// Nearest level (from the top) carrying the given group.
    pub fn level_with_group(&self, group: &str) -> Option<&Level> {
        self.iter_from_top()
            .find(|l| l.group.as_deref() == Some(group))
    }

    pub fn setup_abstractions(&self) -> &HashMap<String, String> {
        &self.setup_abstractions
    }

    /// Look up a required setup abstraction.
    pub fn abstraction(&self, key: &str) -> Result<&str> {
        self.setup_abstractions
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| EngineError::MissingAbstraction(key.to_string()))
    }

    pub fn account_id(&self) -> Result<&str> {
        self.abstraction(abstraction_keys::ACCOUNT_ID)
    }

    pub fn org_identifier(&self) -> Result<&str> {
        self.abstraction(abstraction_keys::ORG_IDENTIFIER)
    }

    pub fn project_identifier(&self) -> Result<&str> {
        self.abstraction(abstraction_keys::PROJECT_IDENTIFIER)
    }
}

impl PartialEq for Ambiance {
    fn eq(&self, other: &Self) -> bool {
        self.plan_execution_id == other.plan_execution_id
            && self.plan_id == other.plan_id
            && self.setup_abstractions == other.setup_abstractions
            && self.depth() == other.depth()
            && self.iter_from_top().eq(other.iter_from_top())
    }
}

/// Flat, serializable form of an [`Ambiance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AmbianceSnapshot {
    plan_execution_id: String,
    plan_id: String,
    #[serde(default)]
    setup_abstractions: HashMap<String, String>,
    #[serde(default)]
    levels: Vec<Level>,
}

impl From<Ambiance> for AmbianceSnapshot {
    fn from(ambiance: Ambiance) -> Self {
        Self {
            levels: ambiance.levels().into_iter().cloned().collect(),
            setup_abstractions: (*ambiance.setup_abstractions).clone(),
            plan_execution_id: ambiance.plan_execution_id,
            plan_id: ambiance.plan_id,
        }
    }
}

impl From<AmbianceSnapshot> for Ambiance {
    fn from(snapshot: AmbianceSnapshot) -> Self {
        let root = Ambiance::new(
            snapshot.plan_execution_id,
            snapshot.plan_id,
            snapshot.setup_abstractions,
        );
        snapshot
            .levels
            .into_iter()
            .fold(root, |ambiance, level| ambiance.push_level(level))
    }
}
