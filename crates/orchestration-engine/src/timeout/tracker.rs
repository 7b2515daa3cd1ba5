//! Timeout trackers and the registry that builds them from obtainments.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, Result};

pub const ABSOLUTE_TRACKER: &str = "ABSOLUTE";
pub const ACTIVE_TRACKER: &str = "ACTIVE";

/// Deadline policy for one timeout instance.
pub trait TimeoutTracker: Send + Sync + std::fmt::Debug {
    fn tracker_type(&self) -> &'static str;

    fn start(&mut self, at: DateTime<Utc>);

    /// A qualifying activity event, such as a status update from the step.
    fn on_event(&mut self, at: DateTime<Utc>);

    /// `None` until started.
    fn expires_at(&self) -> Option<DateTime<Utc>>;

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |deadline| now >= deadline)
    }
}

/// Milliseconds as a [`Duration`], saturating at the largest representable span.
pub fn saturating_millis(millis: u64) -> Duration {
    i64::try_from(millis)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

/// Deadline fixed at start + duration.
#[derive(Debug, Clone)]
pub struct AbsoluteTimeoutTracker {
    duration: Duration,
    started_at: Option<DateTime<Utc>>,
}

impl AbsoluteTimeoutTracker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started_at: None,
        }
    }
}

impl TimeoutTracker for AbsoluteTimeoutTracker {
    fn tracker_type(&self) -> &'static str {
        ABSOLUTE_TRACKER
    }

    fn start(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
    }

    fn on_event(&mut self, _at: DateTime<Utc>) {}

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        // A deadline past the representable range never expires.
        self.started_at
            .and_then(|start| start.checked_add_signed(self.duration))
    }
}

/// Deadline pushed forward by every activity event; expires after a quiet period.
#[derive(Debug, Clone)]
pub struct ActiveTimeoutTracker {
    quiet_duration: Duration,
    last_activity: Option<DateTime<Utc>>,
}

impl ActiveTimeoutTracker {
    pub fn new(quiet_duration: Duration) -> Self {
        Self {
            quiet_duration,
            last_activity: None,
        }
    }
}

impl TimeoutTracker for ActiveTimeoutTracker {
    fn tracker_type(&self) -> &'static str {
        ACTIVE_TRACKER
    }

    fn start(&mut self, at: DateTime<Utc>) {
        self.last_activity = Some(at);
    }

    fn on_event(&mut self, at: DateTime<Utc>) {
        // Out-of-order events never pull the deadline back.
        if let Some(last) = self.last_activity {
            if at > last {
                self.last_activity = Some(at);
            }
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity
            .and_then(|last| last.checked_add_signed(self.quiet_duration))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerParameters {
    timeout_ms: u64,
}

type TrackerFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn TimeoutTracker>> + Send + Sync>;

fn duration_param(tracker_type: &str, parameters: &Value) -> Result<Duration> {
    let params: TrackerParameters = serde_json::from_value(parameters.clone())
        .map_err(|e| EngineError::invalid_parameters(tracker_type, e))?;
    i64::try_from(params.timeout_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .ok_or_else(|| {
            EngineError::invalid_parameters(
                tracker_type,
                format!("timeoutMs {} is out of range", params.timeout_ms),
            )
        })
}

fn build_absolute(parameters: &Value) -> Result<Box<dyn TimeoutTracker>> {
    let duration = duration_param(ABSOLUTE_TRACKER, parameters)?;
    Ok(Box::new(AbsoluteTimeoutTracker::new(duration)))
}

fn build_active(parameters: &Value) -> Result<Box<dyn TimeoutTracker>> {
    let duration = duration_param(ACTIVE_TRACKER, parameters)?;
    Ok(Box::new(ActiveTimeoutTracker::new(duration)))
}

/// Maps tracker type tags to constructors taking JSON parameters.
#[derive(Default)]
pub struct TimeoutTrackerRegistry {
    factories: HashMap<String, TrackerFactory>,
}

impl TimeoutTrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ABSOLUTE_TRACKER, build_absolute);
        registry.register(ACTIVE_TRACKER, build_active);
        registry
    }

    pub fn register<F>(&mut self, tracker_type: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn TimeoutTracker>> + Send + Sync + 'static,
    {
        self.factories.insert(tracker_type.into(), Arc::new(factory));
    }

    pub fn contains(&self, tracker_type: &str) -> bool {
        self.factories.contains_key(tracker_type)
    }

    pub fn create(&self, tracker_type: &str, parameters: &Value) -> Result<Box<dyn TimeoutTracker>> {
        let factory = self
            .factories
            .get(tracker_type)
            .ok_or_else(|| EngineError::UnknownTimeoutTracker(tracker_type.to_string()))?;
        factory(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_absolute_ignores_activity() {
        let mut tracker = AbsoluteTimeoutTracker::new(Duration::seconds(60));
        assert!(tracker.expires_at().is_none());
        tracker.start(t0());
        for secs in [10, 30, 50, 59] {
            tracker.on_event(t0() + Duration::seconds(secs));
        }
        assert!(!tracker.is_expired(t0() + Duration::seconds(59)));
        assert!(tracker.is_expired(t0() + Duration::seconds(60)));
    }

    #[test]
    fn test_active_resets_on_activity() {
        let mut tracker = ActiveTimeoutTracker::new(Duration::seconds(60));
        tracker.start(t0());
        let mut last = t0();
        for step in 1..=10 {
            let at = t0() + Duration::seconds(45 * step);
            assert!(!tracker.is_expired(at), "expired while active at step {}", step);
            tracker.on_event(at);
            last = at;
        }
        assert!(!tracker.is_expired(last + Duration::seconds(59)));
        assert!(tracker.is_expired(last + Duration::seconds(60)));
    }

    #[test]
    fn test_active_ignores_stale_events() {
        let mut tracker = ActiveTimeoutTracker::new(Duration::seconds(60));
        tracker.start(t0() + Duration::seconds(30));
        tracker.on_event(t0());
        assert_eq!(tracker.expires_at(), Some(t0() + Duration::seconds(90)));
    }

    #[test]
    fn test_huge_durations_do_not_overflow() {
        let mut absolute = AbsoluteTimeoutTracker::new(saturating_millis(u64::MAX));
        absolute.start(t0());
        assert!(absolute.expires_at().is_none());
        assert!(!absolute.is_expired(t0() + Duration::days(365 * 10_000)));

        let mut active = ActiveTimeoutTracker::new(Duration::milliseconds(9_000_000_000_000_000));
        active.start(t0());
        active.on_event(t0() + Duration::seconds(1));
        assert!(!active.is_expired(t0() + Duration::days(365 * 10_000)));

        let registry = TimeoutTrackerRegistry::with_builtins();
        assert!(matches!(
            registry.create(ABSOLUTE_TRACKER, &json!({ "timeoutMs": u64::MAX })),
            Err(EngineError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_registry_builds_trackers() {
        let registry = TimeoutTrackerRegistry::with_builtins();
        let tracker = registry
            .create(ACTIVE_TRACKER, &json!({ "timeoutMs": 1000 }))
            .unwrap();
        assert_eq!(tracker.tracker_type(), ACTIVE_TRACKER);

        assert!(matches!(
            registry.create("LUNAR", &json!({})),
            Err(EngineError::UnknownTimeoutTracker(_))
        ));
        assert!(matches!(
            registry.create(ABSOLUTE_TRACKER, &json!({})),
            Err(EngineError::InvalidParameters { .. })
        ));
    }
}
