//! Externally issued control signals and their durable records.
//!
//! An [`Interrupt`] is saved as REGISTERED before the engine acts on it. The
//! effect on each node is appended to that node's history as an
//! [`InterruptEffect`] in the same versioned update that changes its status,
//! and the interrupt is then marked PROCESSED (or DISCARDED when nothing was
//! applicable). Interrupts still REGISTERED after a crash are replayed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::execution::FailureInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    AbortAll,
    Pause,
    PauseAll,
    Resume,
    ResumeAll,
    Retry,
    Ignore,
    MarkExpired,
    MarkSuccess,
    MarkFailed,
    CustomFailure,
}

impl InterruptType {
    /// Kinds that act on the whole plan execution rather than one node.
    pub fn is_plan_wide(self) -> bool {
        matches!(
            self,
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll
        )
    }
}

impl std::fmt::Display for InterruptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Pause => "PAUSE",
            InterruptType::PauseAll => "PAUSE_ALL",
            InterruptType::Resume => "RESUME",
            InterruptType::ResumeAll => "RESUME_ALL",
            InterruptType::Retry => "RETRY",
            InterruptType::Ignore => "IGNORE",
            InterruptType::MarkExpired => "MARK_EXPIRED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::CustomFailure => "CUSTOM_FAILURE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processed,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    pub id: String,
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<String>,
    #[serde(default)]
    pub issued_by: String,
    pub created_at: DateTime<Utc>,
    pub state: InterruptState,
    /// Failure reported by MARK_FAILED / CUSTOM_FAILURE.
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

impl Interrupt {
    pub fn new(interrupt_type: InterruptType, plan_execution_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            interrupt_type,
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            issued_by: String::new(),
            created_at: Utc::now(),
            state: InterruptState::Registered,
            failure_info: None,
        }
    }

    pub fn for_node(mut self, node_execution_id: impl Into<String>) -> Self {
        self.node_execution_id = Some(node_execution_id.into());
        self
    }

    pub fn issued_by(mut self, issuer: impl Into<String>) -> Self {
        self.issued_by = issuer.into();
        self
    }

    pub fn with_failure(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    pub fn effect(&self) -> InterruptEffect {
        InterruptEffect {
            interrupt_id: self.id.clone(),
            took_effect_at: Utc::now(),
            interrupt_type: self.interrupt_type,
        }
    }
}

/// Immutable audit record of an interrupt taking effect on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub took_effect_at: DateTime<Utc>,
    pub interrupt_type: InterruptType,
}

#[async_trait]
pub trait InterruptRepository: Send + Sync {
    async fn save(&self, interrupt: Interrupt) -> Result<Interrupt>;

    async fn get(&self, id: &str) -> Result<Option<Interrupt>>;

    async fn mark(&self, id: &str, state: InterruptState) -> Result<()>;

    /// REGISTERED interrupts, oldest first, optionally for one plan execution.
    async fn find_registered(&self, plan_execution_id: Option<&str>) -> Result<Vec<Interrupt>>;
}

#[derive(Default)]
pub struct InMemoryInterruptRepository {
    interrupts: Mutex<Vec<Interrupt>>,
}

impl InMemoryInterruptRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterruptRepository for InMemoryInterruptRepository {
    async fn save(&self, interrupt: Interrupt) -> Result<Interrupt> {
        let mut interrupts = self.interrupts.lock();
        match interrupts.iter_mut().find(|i| i.id == interrupt.id) {
            Some(existing) => *existing = interrupt.clone(),
            None => interrupts.push(interrupt.clone()),
        }
        Ok(interrupt)
    }

    async fn get(&self, id: &str) -> Result<Option<Interrupt>> {
        Ok(self.interrupts.lock().iter().find(|i| i.id == id).cloned())
    }

    async fn mark(&self, id: &str, state: InterruptState) -> Result<()> {
        if let Some(interrupt) = self.interrupts.lock().iter_mut().find(|i| i.id == id) {
            interrupt.state = state;
        }
        Ok(())
    }

    async fn find_registered(&self, plan_execution_id: Option<&str>) -> Result<Vec<Interrupt>> {
        Ok(self
            .interrupts
            .lock()
            .iter()
            .filter(|i| i.state == InterruptState::Registered)
            .filter(|i| plan_execution_id.map_or(true, |pe| i.plan_execution_id == pe))
            .cloned()
            .collect())
    }
}
