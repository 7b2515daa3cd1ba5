//! Correlation of externally executed work with waiting node executions.
//!
//! A node that dispatches async work registers a wait group of correlation
//! ids. Responses are collected per id; the group resolves exactly once, when
//! the last id has answered. Anything that arrives afterwards, or twice, is
//! reported as a duplicate and must be dropped by the caller.
//!
//! Work can answer before its wait is registered. The engine-wide
//! [`CorrelationIndex`] holds such responses, bounded in count and age, and
//! hands them over when the wait appears.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::execution::ResponseMap;

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    /// Recorded; other ids of the group are still outstanding.
    Pending,
    /// The group is complete. Resume the node with these responses.
    Ready {
        node_execution_id: String,
        responses: ResponseMap,
    },
    /// The id already answered, or its group already resolved or was cancelled.
    Duplicate,
    /// Nothing waits on this id yet; the response is held until a wait does.
    Buffered,
    /// Nothing waits on this id and the response was not kept.
    Unknown,
}

#[derive(Debug)]
struct WaitGroup {
    node_execution_id: String,
    callback_ids: Vec<String>,
    responses: ResponseMap,
}

/// Wait groups of one plan execution.
///
/// Only open groups are kept. Ids of resolved or cancelled groups are
/// remembered so late answers still read as duplicates.
#[derive(Debug, Default)]
pub struct WaitRegistry {
    groups: HashMap<String, WaitGroup>,
    by_callback: HashMap<String, String>,
    closed: HashSet<String>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `callback_ids` on behalf of a node. Returns the group id.
    pub fn register(&mut self, node_execution_id: &str, callback_ids: &[String]) -> String {
        let group_id = uuid::Uuid::new_v4().to_string();
        for callback_id in callback_ids {
            self.closed.remove(callback_id);
            self.by_callback
                .insert(callback_id.clone(), group_id.clone());
        }
        self.groups.insert(
            group_id.clone(),
            WaitGroup {
                node_execution_id: node_execution_id.to_string(),
                callback_ids: callback_ids.to_vec(),
                responses: ResponseMap::new(),
            },
        );
        log::debug!(
            "Node '{}' waiting on {:?} (group {})",
            node_execution_id,
            callback_ids,
            group_id
        );
        group_id
    }

    pub fn notify(&mut self, callback_id: &str, response: Value) -> NotifyOutcome {
        if self.closed.contains(callback_id) {
            log::debug!("Dropping late response for '{}'", callback_id);
            return NotifyOutcome::Duplicate;
        }
        let Some(group_id) = self.by_callback.get(callback_id).cloned() else {
            return NotifyOutcome::Unknown;
        };
        let Some(group) = self.groups.get_mut(&group_id) else {
            return NotifyOutcome::Unknown;
        };

        if group.responses.contains_key(callback_id) {
            log::debug!("Dropping duplicate response for '{}'", callback_id);
            return NotifyOutcome::Duplicate;
        }
        group.responses.insert(callback_id.to_string(), response);
        if !group
            .callback_ids
            .iter()
            .all(|id| group.responses.contains_key(id))
        {
            return NotifyOutcome::Pending;
        }

        match self.close(&group_id) {
            Some(group) => NotifyOutcome::Ready {
                node_execution_id: group.node_execution_id,
                responses: group.responses,
            },
            None => NotifyOutcome::Unknown,
        }
    }

    /// Resolve the node's open groups without resuming it. Returns the
    /// callback ids that were still outstanding.
    pub fn cancel_for_node(&mut self, node_execution_id: &str) -> Vec<String> {
        let group_ids: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, g)| g.node_execution_id == node_execution_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut outstanding = Vec::new();
        for group in group_ids.iter().filter_map(|id| self.close(id)) {
            outstanding.extend(
                group
                    .callback_ids
                    .into_iter()
                    .filter(|id| !group.responses.contains_key(id)),
            );
        }
        outstanding
    }

    fn close(&mut self, group_id: &str) -> Option<WaitGroup> {
        let group = self.groups.remove(group_id)?;
        for callback_id in &group.callback_ids {
            self.by_callback.remove(callback_id);
            self.closed.insert(callback_id.clone());
        }
        Some(group)
    }
}

/// Where [`CorrelationIndex::route`] sent a response.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// A plan execution waits on the id; deliver the response there.
    Owned {
        plan_execution_id: String,
        response: Value,
    },
    Buffered,
    /// A response for the id is already buffered.
    Duplicate,
    /// Buffering is disabled.
    Dropped,
}

#[derive(Debug)]
struct EarlyResponse {
    response: Value,
    received_at: DateTime<Utc>,
}

/// Engine-wide map from correlation id to the plan execution waiting on it,
/// plus the responses that arrived before any wait did.
#[derive(Debug, Default)]
pub struct CorrelationIndex {
    owners: HashMap<String, String>,
    early: HashMap<String, EarlyResponse>,
    capacity: usize,
}

impl CorrelationIndex {
    /// `capacity` bounds the early responses held; the oldest is evicted first.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn route(&mut self, callback_id: &str, response: Value, now: DateTime<Utc>) -> Routed {
        if let Some(owner) = self.owners.get(callback_id) {
            return Routed::Owned {
                plan_execution_id: owner.clone(),
                response,
            };
        }
        if self.capacity == 0 {
            return Routed::Dropped;
        }
        if self.early.contains_key(callback_id) {
            return Routed::Duplicate;
        }

        while self.early.len() >= self.capacity {
            let Some(oldest) = self
                .early
                .iter()
                .min_by_key(|(_, e)| e.received_at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            log::warn!("Early response buffer full; dropping response for '{}'", oldest);
            self.early.remove(&oldest);
        }
        self.early.insert(
            callback_id.to_string(),
            EarlyResponse {
                response,
                received_at: now,
            },
        );
        Routed::Buffered
    }

    /// Route `callback_ids` to the plan execution from now on. Returns the
    /// responses that were already buffered for them.
    pub fn bind(&mut self, plan_execution_id: &str, callback_ids: &[String]) -> Vec<(String, Value)> {
        let mut early = Vec::new();
        for callback_id in callback_ids {
            self.owners
                .insert(callback_id.clone(), plan_execution_id.to_string());
            if let Some(buffered) = self.early.remove(callback_id) {
                early.push((callback_id.clone(), buffered.response));
            }
        }
        early
    }

    /// Forget every id owned by the plan execution.
    pub fn release(&mut self, plan_execution_id: &str) {
        self.owners.retain(|_, owner| owner != plan_execution_id);
    }

    /// Drop early responses received before `cutoff`. Returns how many went.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.early.len();
        self.early.retain(|_, e| e.received_at >= cutoff);
        before - self.early.len()
    }
}
