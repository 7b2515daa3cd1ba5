//! Per-node deadline tracking.
//!
//! A [`TimeoutEngine`] belongs to one plan execution and holds the timeout
//! instances of its nodes. Nothing fires on its own: a periodic sweep asks
//! for the instances whose deadline has passed and the caller raises the
//! configured interrupt for each.

pub mod tracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interrupt::InterruptType;

pub use tracker::{
    saturating_millis, AbsoluteTimeoutTracker, ActiveTimeoutTracker, TimeoutTracker,
    TimeoutTrackerRegistry, ABSOLUTE_TRACKER, ACTIVE_TRACKER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutState {
    Ticking,
    Expired,
    Stopped,
}

#[derive(Debug)]
pub struct TimeoutInstance {
    pub id: String,
    pub node_execution_id: String,
    pub tracker: Box<dyn TimeoutTracker>,
    /// Interrupt raised against the node when the deadline passes.
    pub on_expiry: InterruptType,
    pub state: TimeoutState,
}

/// A timeout that the sweep found expired.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredTimeout {
    pub instance_id: String,
    pub node_execution_id: String,
    pub on_expiry: InterruptType,
}

#[derive(Debug, Default)]
pub struct TimeoutEngine {
    instances: Vec<TimeoutInstance>,
}

impl TimeoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `tracker` at `now` and track it for the node. Returns the instance id.
    pub fn register(
        &mut self,
        node_execution_id: impl Into<String>,
        mut tracker: Box<dyn TimeoutTracker>,
        on_expiry: InterruptType,
        now: DateTime<Utc>,
    ) -> String {
        tracker.start(now);
        let id = uuid::Uuid::new_v4().to_string();
        self.instances.push(TimeoutInstance {
            id: id.clone(),
            node_execution_id: node_execution_id.into(),
            tracker,
            on_expiry,
            state: TimeoutState::Ticking,
        });
        id
    }

    /// Forward an activity event to the node's ticking trackers.
    pub fn on_activity(&mut self, node_execution_id: &str, at: DateTime<Utc>) {
        for instance in self.ticking_mut(node_execution_id) {
            instance.tracker.on_event(at);
        }
    }

    /// Stop every ticking instance of the node. Expired instances stay expired.
    pub fn stop_for_node(&mut self, node_execution_id: &str) -> usize {
        let mut stopped = 0;
        for instance in self.ticking_mut(node_execution_id) {
            instance.state = TimeoutState::Stopped;
            stopped += 1;
        }
        stopped
    }

    /// Mark and return every ticking instance whose deadline is at or before
    /// `now`, then drop the instances that no longer tick.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ExpiredTimeout> {
        let mut expired = Vec::new();
        for instance in &mut self.instances {
            if instance.state == TimeoutState::Ticking && instance.tracker.is_expired(now) {
                instance.state = TimeoutState::Expired;
                expired.push(ExpiredTimeout {
                    instance_id: instance.id.clone(),
                    node_execution_id: instance.node_execution_id.clone(),
                    on_expiry: instance.on_expiry,
                });
            }
        }
        self.instances
            .retain(|instance| instance.state == TimeoutState::Ticking);
        expired
    }

    fn ticking_mut<'a>(
        &'a mut self,
        node_execution_id: &'a str,
    ) -> impl Iterator<Item = &'a mut TimeoutInstance> + 'a {
        self.instances.iter_mut().filter(move |i| {
            i.node_execution_id == node_execution_id && i.state == TimeoutState::Ticking
        })
    }
}
