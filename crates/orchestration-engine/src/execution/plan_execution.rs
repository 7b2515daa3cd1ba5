//! One instantiation of a plan for a specific trigger.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::status::Status;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanExecution {
    pub id: String,
    pub plan_id: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    /// After this instant a terminal execution may be archived.
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
    /// Set by PAUSE_ALL; newly scheduled nodes start paused while true.
    #[serde(default)]
    pub pause_requested: bool,
    /// Number of node executions created so far.
    #[serde(default)]
    pub node_execution_count: u32,
    #[serde(default)]
    pub version: u64,
}

impl PlanExecution {
    pub fn new(
        id: impl Into<String>,
        plan_id: impl Into<String>,
        setup_abstractions: HashMap<String, String>,
        retention: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            status: Status::Running,
            created_at,
            end_ts: None,
            valid_until: created_at + retention,
            setup_abstractions,
            pause_requested: false,
            node_execution_count: 0,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Finish the execution. Returns false if it had already finished.
    pub fn finish(&mut self, status: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_ts = Some(Utc::now());
        true
    }

    /// Whether the retention window has elapsed for a finished execution.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && now >= self.valid_until
    }
}
