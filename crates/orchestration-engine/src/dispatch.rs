//! Hand-off of task work to the external delegate pool.
//!
//! The engine emits a [`TaskRequest`] carrying the payload, the setup
//! abstractions and the correlation id the response must be posted back
//! under. Delivery of that response is at-least-once; deduplication happens
//! in the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    pub task_identifier: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub abstractions: HashMap<String, String>,
    /// Id the response must be notified under.
    pub callback_id: String,
    pub plan_execution_id: String,
    pub node_execution_id: String,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, request: TaskRequest) -> Result<()>;

    /// Best-effort cancellation of a dispatched task.
    async fn abort(&self, task_id: &str) -> Result<()>;
}

/// Dispatcher that drops every task. Tasks never answer unless notified by hand.
pub struct NullTaskDispatcher;

#[async_trait]
impl TaskDispatcher for NullTaskDispatcher {
    async fn dispatch(&self, request: TaskRequest) -> Result<()> {
        log::debug!(
            "Dropping task '{}' ({}) for node '{}'",
            request.task_id,
            request.task_identifier,
            request.node_execution_id
        );
        Ok(())
    }

    async fn abort(&self, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Records dispatched and aborted tasks.
///
/// Useful for testing to see what reached the delegate boundary.
#[derive(Default)]
pub struct RecordingTaskDispatcher {
    dispatched: Mutex<Vec<TaskRequest>>,
    aborted: Mutex<Vec<String>>,
}

impl RecordingTaskDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<TaskRequest> {
        self.dispatched.lock().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().clone()
    }

    /// Latest request dispatched for a node execution.
    pub fn request_for(&self, node_execution_id: &str) -> Option<TaskRequest> {
        self.dispatched
            .lock()
            .iter()
            .rev()
            .find(|r| r.node_execution_id == node_execution_id)
            .cloned()
    }
}

#[async_trait]
impl TaskDispatcher for RecordingTaskDispatcher {
    async fn dispatch(&self, request: TaskRequest) -> Result<()> {
        self.dispatched.lock().push(request);
        Ok(())
    }

    async fn abort(&self, task_id: &str) -> Result<()> {
        self.aborted.lock().push(task_id.to_string());
        Ok(())
    }
}
