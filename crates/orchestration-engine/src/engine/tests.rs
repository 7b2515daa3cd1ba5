use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use super::*;
use crate::adviser::Advise;
use crate::dispatch::RecordingTaskDispatcher;
use crate::events::VecEventSink;
use crate::execution::{ChildrenMode, FailureType};
use crate::interrupt::{InterruptState, InterruptType};
use crate::plan::{PlanBuilder, SkipCondition, ValidationError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn abstractions() -> HashMap<String, String> {
    HashMap::from([
        ("accountId".to_string(), "acc-1".to_string()),
        ("env".to_string(), "prod".to_string()),
    ])
}

fn callback_id(params: &Value) -> String {
    params["callbackId"].as_str().unwrap_or_default().to_string()
}

/// Builder with the step types the scenarios below use.
fn builder() -> EngineBuilder {
    OrchestrationEngine::builder()
        .with_sync_step("OK", |_ambiance, params| Ok(StepResponse::success(params.clone())))
        .with_sync_step("FAIL", |_ambiance, _params| {
            Ok(StepResponse::failure(FailureInfo::new(
                "deployment rejected",
                FailureType::ApplicationError,
            )))
        })
        .with_sync_step("FAIL_CONN", |_ambiance, _params| {
            Ok(StepResponse::failure(FailureInfo::new(
                "connection refused",
                FailureType::Connectivity,
            )))
        })
        .with_callback_step("WAIT", ExecutionMode::Async, |_ambiance, params| async move {
            Ok(ExecutableResponse::Async {
                callback_ids: vec![callback_id(&params)],
            })
        })
        .with_callback_step("TASK", ExecutionMode::Task, |_ambiance, params| async move {
            Ok(ExecutableResponse::task("shell", params))
        })
        .with_callback_step("FORK", ExecutionMode::Children, |_ambiance, params| async move {
            let child_node_ids = params["children"]
                .as_array()
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let mode = match params["min"].as_u64() {
                Some(count) => ChildrenMode::Min {
                    count: count as usize,
                },
                None => ChildrenMode::All,
            };
            Ok(ExecutableResponse::Children {
                child_node_ids,
                mode,
            })
        })
}

async fn finish(engine: &OrchestrationEngine, plan_execution_id: &str) -> Status {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for_plan(plan_execution_id))
        .await
        .expect("plan execution did not finish in time")
        .unwrap()
}

/// Poll until the latest execution of `plan_node_id` satisfies `check`.
async fn node_of(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    plan_node_id: &str,
    check: impl Fn(&NodeExecution) -> bool,
) -> NodeExecution {
    for _ in 0..1000 {
        let latest = engine
            .node_executions(plan_execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.plan_node_id == plan_node_id)
            .last();
        if let Some(node) = latest {
            if check(&node) {
                return node;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node '{}' never reached the expected state", plan_node_id);
}

async fn node_in(
    engine: &OrchestrationEngine,
    plan_execution_id: &str,
    plan_node_id: &str,
    status: Status,
) -> NodeExecution {
    node_of(engine, plan_execution_id, plan_node_id, |n| n.status == status).await
}

/// Poll until the finished execution has dropped its volatile state.
async fn released(engine: &OrchestrationEngine, plan_execution_id: &str) {
    for _ in 0..1000 {
        if engine.find_runtime(plan_execution_id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("plan execution '{}' kept its runtime", plan_execution_id);
}

fn failed_response(message: &str) -> Value {
    json!({
        "status": "FAILED",
        "failureInfo": {"message": message, "failureTypes": ["APPLICATION_ERROR"]}
    })
}

fn barrier_plan() -> Plan {
    PlanBuilder::new("barriers")
        .add_node("fork", "FORK")
        .with_parameters(json!({"children": ["work_1", "work_2", "work_3"]}))
        .with_children(["work_1", "work_2", "work_3"])
        .add_node("work_1", "WAIT")
        .with_parameters(json!({"callbackId": "w1"}))
        .then("barrier_1")
        .add_barrier("barrier_1", "B1")
        .add_node("work_2", "WAIT")
        .with_parameters(json!({"callbackId": "w2"}))
        .then("barrier_2")
        .add_barrier("barrier_2", "B1")
        .add_node("work_3", "WAIT")
        .with_parameters(json!({"callbackId": "w3"}))
        .then("barrier_3")
        .add_barrier("barrier_3", "B1")
        .build()
}

async fn assert_barrier_waiters_aborted(engine: &OrchestrationEngine, plan_execution_id: &str) {
    assert_eq!(finish(engine, plan_execution_id).await, Status::Aborted);

    let nodes = engine.node_executions(plan_execution_id).await.unwrap();
    let status_of = |id: &str| {
        nodes
            .iter()
            .find(|n| n.plan_node_id == id)
            .map(|n| n.status)
    };
    assert_eq!(status_of("work_3"), Some(Status::Failed));
    assert_eq!(status_of("barrier_1"), Some(Status::Aborted));
    assert_eq!(status_of("barrier_2"), Some(Status::Aborted));
    assert_eq!(status_of("barrier_3"), None);
    assert_eq!(status_of("fork"), Some(Status::Aborted));

    let barrier_1 = nodes.iter().find(|n| n.plan_node_id == "barrier_1").unwrap();
    assert_eq!(barrier_1.adviser_response, Some(Advise::Abort));
    assert_eq!(
        barrier_1.failure_info.as_ref().map(|f| f.message.as_str()),
        Some("Barrier failed")
    );
}

#[tokio::test]
async fn test_linear_plan_succeeds() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = builder().with_event_sink(events.clone()).build();
    let plan = PlanBuilder::new("linear")
        .add_node("build", "OK")
        .with_parameters(json!({"artifact": "app.tar"}))
        .then("deploy")
        .add_node("deploy", "OK")
        .with_group("STAGE")
        .build();

    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);

    let nodes = engine.node_executions(&pe).await.unwrap();
    assert_eq!(nodes.len(), 2);
    let (build, deploy) = (&nodes[0], &nodes[1]);
    assert_eq!(build.output, json!({"artifact": "app.tar"}));
    assert_eq!(deploy.previous_id.as_deref(), Some(build.id.as_str()));
    assert_eq!(deploy.ambiance.depth(), 1);
    assert_eq!(deploy.ambiance.current_group(), Some("STAGE"));
    assert_eq!(deploy.ambiance.account_id().unwrap(), "acc-1");

    assert_eq!(
        events.node_transitions(&build.id),
        vec![
            (Status::Queued, Status::Running),
            (Status::Running, Status::Succeeded)
        ]
    );
    assert!(events.events().iter().any(|e| matches!(
        e,
        OrchestrationEvent::PlanStatusChanged {
            new_status: Status::Succeeded,
            ..
        }
    )));

    let plan_execution = engine.plan_execution(&pe).await.unwrap();
    assert_eq!(plan_execution.status, Status::Succeeded);
    assert!(plan_execution.end_ts.is_some());
    assert_eq!(plan_execution.node_execution_count, 2);
}

#[tokio::test]
async fn test_interrupt_on_finished_node_is_discarded() {
    let engine = builder().build();
    let plan = PlanBuilder::new("single").add_node("only", "OK").build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    finish(&engine, &pe).await;

    let node = node_in(&engine, &pe, "only", Status::Succeeded).await;
    let interrupt = engine
        .interrupt(Interrupt::new(InterruptType::Abort, &pe).for_node(&node.id))
        .await
        .unwrap();

    assert_eq!(interrupt.state, InterruptState::Discarded);
    let node = engine.node_execution(&node.id).await.unwrap();
    assert_eq!(node.status, Status::Succeeded);
    assert!(node.interrupt_history.is_empty());
}

#[tokio::test]
async fn test_duplicate_response_is_dropped() {
    let events = Arc::new(VecEventSink::new());
    let engine = builder().with_event_sink(events.clone()).build();
    let plan = PlanBuilder::new("async")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-1"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    let first = engine.notify("cb-1", json!({"ok": true})).await.unwrap();
    assert!(matches!(first, NotifyOutcome::Ready { .. }));
    let second = engine.notify("cb-1", json!({"ok": false})).await.unwrap();
    assert_eq!(second, NotifyOutcome::Duplicate);
    assert_eq!(
        engine.notify("never-issued", json!({})).await.unwrap(),
        NotifyOutcome::Buffered
    );

    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    let node = engine.node_execution(&waiting.id).await.unwrap();
    assert_eq!(node.output, json!({"cb-1": {"ok": true}}));
    assert_eq!(
        events.node_transitions(&node.id),
        vec![
            (Status::Queued, Status::Running),
            (Status::Running, Status::AsyncWaiting),
            (Status::AsyncWaiting, Status::Running),
            (Status::Running, Status::Succeeded),
        ]
    );

    // A late duplicate after completion changes nothing.
    released(&engine, &pe).await;
    assert_eq!(
        engine.notify("cb-1", json!({"ok": false})).await.unwrap(),
        NotifyOutcome::Buffered
    );
    assert_eq!(engine.node_execution(&node.id).await.unwrap().version, node.version);
}

#[tokio::test]
async fn test_barrier_fails_when_a_forcer_abandons() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let engine = builder().with_event_sink(events.clone()).build();
    let pe = engine.start_plan(barrier_plan(), abstractions()).await.unwrap();

    node_in(&engine, &pe, "work_3", Status::AsyncWaiting).await;
    engine.notify("w1", json!({"ok": true})).await.unwrap();
    engine.notify("w2", json!({"ok": true})).await.unwrap();
    node_in(&engine, &pe, "barrier_1", Status::AsyncWaiting).await;
    node_in(&engine, &pe, "barrier_2", Status::AsyncWaiting).await;

    engine.notify("w3", failed_response("boom")).await.unwrap();

    assert_barrier_waiters_aborted(&engine, &pe).await;
    assert!(events.events().iter().any(|e| matches!(
        e,
        OrchestrationEvent::BarrierResolved { released: false, barrier_ref, .. } if barrier_ref == "B1"
    )));
}

#[tokio::test]
async fn test_barrier_failure_is_order_independent() {
    let engine = builder().build();
    let pe = engine.start_plan(barrier_plan(), abstractions()).await.unwrap();

    node_in(&engine, &pe, "work_3", Status::AsyncWaiting).await;
    engine.notify("w3", failed_response("boom")).await.unwrap();
    node_in(&engine, &pe, "work_3", Status::Failed).await;

    engine.notify("w1", json!({"ok": true})).await.unwrap();
    engine.notify("w2", json!({"ok": true})).await.unwrap();

    assert_barrier_waiters_aborted(&engine, &pe).await;
}

#[tokio::test]
async fn test_barrier_releases_when_all_arrive() {
    let engine = builder().build();
    let pe = engine.start_plan(barrier_plan(), abstractions()).await.unwrap();

    node_in(&engine, &pe, "work_3", Status::AsyncWaiting).await;
    for callback in ["w1", "w2", "w3"] {
        engine.notify(callback, json!({"ok": true})).await.unwrap();
    }

    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    let fork = node_in(&engine, &pe, "fork", Status::Succeeded).await;
    assert_eq!(fork.child_results.len(), 3);
    assert!(fork.child_results.values().all(|s| *s == Status::Succeeded));
}

#[tokio::test]
async fn test_retries_then_manual_intervention() {
    init_logging();
    let engine = builder().build();
    let plan = PlanBuilder::new("flaky")
        .add_node("deploy", "FAIL_CONN")
        .with_adviser(
            "RETRY",
            json!({
                "retryCount": 3,
                "repairActionCode": "MANUAL_INTERVENTION",
                "applicableFailureTypes": ["CONNECTIVITY"]
            }),
        )
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    let parked = node_in(&engine, &pe, "deploy", Status::InterventionWaiting).await;
    assert_eq!(parked.retry_count, 3);
    assert_eq!(parked.retry_ids.len(), 3);
    assert!(matches!(
        parked.adviser_response,
        Some(Advise::ManualIntervention { .. })
    ));

    let interrupt = engine
        .interrupt(
            Interrupt::new(InterruptType::MarkSuccess, &pe)
                .for_node(&parked.id)
                .issued_by("operator"),
        )
        .await
        .unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);

    let node = engine.node_execution(&parked.id).await.unwrap();
    assert_eq!(node.status, Status::Succeeded);
    assert_eq!(node.interrupt_history.len(), 1);
    assert_eq!(node.interrupt_history[0].interrupt_id, interrupt.id);

    let nodes = engine.node_executions(&pe).await.unwrap();
    assert_eq!(nodes.len(), 4);
    for old in &nodes[..3] {
        assert_eq!(old.status, Status::Failed);
        assert!(old.old_retry);
        assert!(matches!(old.adviser_response, Some(Advise::Retry { .. })));
    }
    assert_eq!(parked.retry_ids, nodes[..3].iter().map(|n| n.id.clone()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_absolute_timeout_expires_node() {
    let engine = builder().build();
    let plan = PlanBuilder::new("slow")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-slow"}))
        .with_timeout("ABSOLUTE", json!({"timeoutMs": 60_000}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    let now = Utc::now();
    assert_eq!(engine.sweep_timeouts(now).await.unwrap(), 0);
    assert_eq!(
        engine
            .sweep_timeouts(now + chrono::Duration::seconds(61))
            .await
            .unwrap(),
        1
    );

    assert_eq!(finish(&engine, &pe).await, Status::Expired);
    let node = engine.node_execution(&waiting.id).await.unwrap();
    assert_eq!(node.status, Status::Expired);
    assert!(node.failure_info.unwrap().has_type(FailureType::Expired));
    assert_eq!(node.interrupt_history[0].interrupt_type, InterruptType::MarkExpired);

    let late = engine.notify("cb-slow", json!({"ok": true})).await.unwrap();
    assert!(matches!(late, NotifyOutcome::Duplicate | NotifyOutcome::Buffered));
    let after = engine.node_execution(&waiting.id).await.unwrap();
    assert_eq!(after.status, Status::Expired);
    assert_eq!(after.version, node.version);
}

#[tokio::test]
async fn test_active_timeout_is_pushed_by_activity() {
    let engine = builder().build();
    let plan = PlanBuilder::new("chatty")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-chatty"}))
        .with_timeout("ACTIVE", json!({"timeoutMs": 60_000}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    let now = Utc::now();
    engine
        .record_activity(&waiting.id, now + chrono::Duration::seconds(50))
        .await
        .unwrap();
    assert_eq!(
        engine
            .sweep_timeouts(now + chrono::Duration::seconds(61))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        engine
            .sweep_timeouts(now + chrono::Duration::seconds(111))
            .await
            .unwrap(),
        1
    );
    assert_eq!(finish(&engine, &pe).await, Status::Expired);
}

#[tokio::test]
async fn test_manual_intervention_timeout_fails_node() {
    let engine = builder().build();
    let plan = PlanBuilder::new("parked")
        .add_node("deploy", "FAIL")
        .with_adviser(
            "MANUAL_INTERVENTION",
            json!({"timeoutMs": 1_000, "timeoutAction": "MARK_FAILED"}),
        )
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let parked = node_in(&engine, &pe, "deploy", Status::InterventionWaiting).await;

    let fired = engine
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(fired, 1);
    assert_eq!(finish(&engine, &pe).await, Status::Failed);

    let node = engine.node_execution(&parked.id).await.unwrap();
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.interrupt_history[0].interrupt_type, InterruptType::MarkFailed);
}

#[tokio::test]
async fn test_abort_walks_subtree_depth_first() {
    init_logging();
    let events = Arc::new(VecEventSink::new());
    let dispatcher = Arc::new(RecordingTaskDispatcher::new());
    let engine = builder()
        .with_event_sink(events.clone())
        .with_dispatcher(dispatcher.clone())
        .build();
    let plan = PlanBuilder::new("tree")
        .add_node("root", "FORK")
        .with_parameters(json!({"children": ["a", "b"]}))
        .with_children(["a", "b"])
        .add_node("a", "FORK")
        .with_parameters(json!({"children": ["a1"]}))
        .with_children(["a1"])
        .add_node("a1", "WAIT")
        .with_parameters(json!({"callbackId": "cb-a1"}))
        .add_node("b", "TASK")
        .with_parameters(json!({"script": "sleep 600"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    node_in(&engine, &pe, "a1", Status::AsyncWaiting).await;
    let b = node_in(&engine, &pe, "b", Status::TaskWaiting).await;
    let root = node_in(&engine, &pe, "root", Status::Running).await;

    let interrupt = engine
        .interrupt(Interrupt::new(InterruptType::Abort, &pe).for_node(&root.id))
        .await
        .unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert_eq!(finish(&engine, &pe).await, Status::Aborted);

    let nodes = engine.node_executions(&pe).await.unwrap();
    let plan_node_of = |id: &str| {
        nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.plan_node_id.clone())
            .unwrap()
    };
    let aborted: Vec<String> = events
        .events()
        .iter()
        .filter_map(|e| match e {
            OrchestrationEvent::NodeStatusChanged {
                node_execution_id,
                old_status: Status::Discontinuing,
                new_status: Status::Aborted,
                ..
            } => Some(plan_node_of(node_execution_id)),
            _ => None,
        })
        .collect();
    assert_eq!(aborted, vec!["root", "a", "a1", "b"]);

    for node in &nodes {
        assert_eq!(node.status, Status::Aborted);
        assert_eq!(node.interrupt_history.len(), 1);
    }
    let task_id = dispatcher.request_for(&b.id).unwrap().task_id;
    assert_eq!(dispatcher.aborted(), vec![task_id]);
}

#[tokio::test]
async fn test_min_children_releases_parent_once() {
    let events = Arc::new(VecEventSink::new());
    let engine = builder().with_event_sink(events.clone()).build();
    let plan = PlanBuilder::new("quorum")
        .add_node("fork", "FORK")
        .with_parameters(json!({"children": ["c1", "c2", "c3"], "min": 2}))
        .with_children(["c1", "c2", "c3"])
        .then("after")
        .add_node("c1", "OK")
        .add_node("c2", "OK")
        .add_node("c3", "WAIT")
        .with_parameters(json!({"callbackId": "cb-c3"}))
        .add_node("after", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    node_in(&engine, &pe, "after", Status::Succeeded).await;
    let fork = node_in(&engine, &pe, "fork", Status::Succeeded).await;
    let c3 = node_in(&engine, &pe, "c3", Status::AsyncWaiting).await;
    assert_eq!(c3.parent_id.as_deref(), Some(fork.id.as_str()));
    assert_eq!(c3.ambiance.depth(), 2);
    assert_eq!(
        engine.plan_execution(&pe).await.unwrap().status,
        Status::Running
    );

    engine.notify("cb-c3", json!({"ok": true})).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);

    let fork = engine.node_execution(&fork.id).await.unwrap();
    assert_eq!(fork.child_results.len(), 3);
    assert_eq!(
        events.node_transitions(&fork.id),
        vec![
            (Status::Queued, Status::Running),
            (Status::Running, Status::Succeeded)
        ]
    );
}

#[tokio::test]
async fn test_missing_step_errors_node() {
    let engine = builder()
        .with_facilitator("GHOST", Arc::new(ModeFacilitator::for_mode(ExecutionMode::Sync)))
        .build();
    let plan = PlanBuilder::new("ghost").add_node("ghost", "GHOST").build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Errored);
    let node = node_in(&engine, &pe, "ghost", Status::Errored).await;
    assert!(node.failure_info.unwrap().message.contains("GHOST"));
}

#[tokio::test]
async fn test_pause_buffers_response_until_resume() {
    let engine = builder().build();
    let plan = PlanBuilder::new("pausable")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-p"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    let pause = engine
        .interrupt(Interrupt::new(InterruptType::Pause, &pe).for_node(&waiting.id))
        .await
        .unwrap();
    assert_eq!(pause.state, InterruptState::Processed);

    engine.notify("cb-p", json!({"ok": true})).await.unwrap();
    let paused = node_of(&engine, &pe, "wait", |n| !n.pending_responses.is_empty()).await;
    assert_eq!(paused.status, Status::Paused);
    assert_eq!(paused.paused_from, Some(Status::AsyncWaiting));

    engine
        .interrupt(Interrupt::new(InterruptType::Resume, &pe).for_node(&waiting.id))
        .await
        .unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);

    let node = engine.node_execution(&waiting.id).await.unwrap();
    assert_eq!(node.output, json!({"cb-p": {"ok": true}}));
    assert!(node.pending_responses.is_empty());
    assert_eq!(node.interrupt_history.len(), 2);
}

#[tokio::test]
async fn test_pause_all_holds_new_nodes() {
    let engine = builder().build();
    let plan = PlanBuilder::new("pause-all")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-pa"}))
        .then("next")
        .add_node("next", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    engine
        .interrupt(Interrupt::new(InterruptType::PauseAll, &pe))
        .await
        .unwrap();
    assert!(engine.plan_execution(&pe).await.unwrap().pause_requested);
    node_in(&engine, &pe, "wait", Status::Paused).await;

    engine.notify("cb-pa", json!({})).await.unwrap();
    node_of(&engine, &pe, "wait", |n| !n.pending_responses.is_empty()).await;

    engine
        .interrupt(Interrupt::new(InterruptType::ResumeAll, &pe))
        .await
        .unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    assert!(!engine.plan_execution(&pe).await.unwrap().pause_requested);
}

#[tokio::test]
async fn test_registered_interrupt_is_replayed() {
    let interrupts = Arc::new(InMemoryInterruptRepository::new());
    let engine = builder().with_interrupt_repository(interrupts.clone()).build();
    let plan = PlanBuilder::new("replay")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-r"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    // Persisted but never applied, as if the process died right after saving.
    let pending = interrupts
        .save(Interrupt::new(InterruptType::Abort, &pe).for_node(&waiting.id))
        .await
        .unwrap();

    assert_eq!(engine.replay_pending_interrupts().await.unwrap(), 1);
    assert_eq!(finish(&engine, &pe).await, Status::Aborted);
    assert_eq!(
        interrupts.get(&pending.id).await.unwrap().unwrap().state,
        InterruptState::Processed
    );
    assert_eq!(engine.replay_pending_interrupts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rollback_schedules_rollback_node() {
    let engine = builder().build();
    let plan = PlanBuilder::new("rollback")
        .add_node("deploy", "FAIL")
        .with_adviser("ROLLBACK", json!({"rollbackNodeId": "undo"}))
        .add_node("undo", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Failed);
    let deploy = node_in(&engine, &pe, "deploy", Status::Failed).await;
    let undo = node_in(&engine, &pe, "undo", Status::Succeeded).await;
    assert_eq!(undo.previous_id.as_deref(), Some(deploy.id.as_str()));
}

#[tokio::test]
async fn test_end_plan_aborts_siblings() {
    let engine = builder().build();
    let plan = PlanBuilder::new("end-plan")
        .add_node("fork", "FORK")
        .with_parameters(json!({"children": ["doomed", "slow"]}))
        .with_children(["doomed", "slow"])
        .add_node("doomed", "FAIL")
        .with_adviser("END_PLAN", json!({}))
        .add_node("slow", "WAIT")
        .with_parameters(json!({"callbackId": "cb-slow"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Failed);
    node_in(&engine, &pe, "doomed", Status::Failed).await;
    node_in(&engine, &pe, "fork", Status::Aborted).await;
    node_in(&engine, &pe, "slow", Status::Aborted).await;
}

#[tokio::test]
async fn test_skip_condition_skips_node() {
    let engine = builder().build();
    let plan = PlanBuilder::new("skip")
        .add_node("approval", "FAIL")
        .with_skip_condition(SkipCondition::AbstractionEquals {
            key: "env".into(),
            value: "prod".into(),
        })
        .then("deploy")
        .add_node("deploy", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    node_in(&engine, &pe, "approval", Status::Skipped).await;
    node_in(&engine, &pe, "deploy", Status::Succeeded).await;
}

#[tokio::test]
async fn test_task_dispatch_carries_abstractions() {
    let dispatcher = Arc::new(RecordingTaskDispatcher::new());
    let engine = builder().with_dispatcher(dispatcher.clone()).build();
    let plan = PlanBuilder::new("task")
        .add_node("shell", "TASK")
        .with_parameters(json!({"script": "make test"}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let waiting = node_in(&engine, &pe, "shell", Status::TaskWaiting).await;

    let request = dispatcher.request_for(&waiting.id).unwrap();
    assert_eq!(request.callback_id, request.task_id);
    assert_eq!(request.payload, json!({"script": "make test"}));
    assert_eq!(request.abstractions["accountId"], "acc-1");
    assert_eq!(request.plan_execution_id, pe);

    engine.notify(&request.task_id, json!({"exitCode": 0})).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
}

#[tokio::test]
async fn test_execution_limit_errors_plan() {
    let config = EngineConfig {
        max_node_executions_per_plan: 2,
        ..EngineConfig::default()
    };
    let engine = builder().with_config(config).build();
    let plan = PlanBuilder::new("runaway")
        .add_node("a", "OK")
        .then("b")
        .add_node("b", "OK")
        .then("c")
        .add_node("c", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Errored);
    let nodes = engine.node_executions(&pe).await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].status, Status::Errored);
}

#[tokio::test]
async fn test_invalid_and_registered_plans() {
    let engine = builder().build();

    let dangling = PlanBuilder::new("dangling")
        .add_node("a", "OK")
        .then("missing")
        .build();
    assert!(matches!(
        engine.start_plan(dangling, abstractions()).await,
        Err(EngineError::InvalidPlan(_))
    ));

    let unknown_type = PlanBuilder::new("unknown").add_node("a", "NOPE").build();
    assert!(engine.register_plan(unknown_type).is_err());

    engine
        .register_plan(PlanBuilder::new("stored").add_node("a", "OK").build())
        .unwrap();
    assert_eq!(engine.registered_plans().len(), 1);
    let pe = engine
        .start_registered_plan("stored", abstractions())
        .await
        .unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);

    assert!(matches!(
        engine.start_registered_plan("absent", abstractions()).await,
        Err(EngineError::PlanNotFound(_))
    ));
}

#[tokio::test]
async fn test_purge_removes_expired_executions() {
    let config = EngineConfig {
        retention_days: 0,
        ..EngineConfig::default()
    };
    let engine = builder().with_config(config).build();
    let plan = PlanBuilder::new("short-lived").add_node("a", "OK").build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    finish(&engine, &pe).await;

    let purged = engine
        .purge_expired_plan_executions(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, vec![pe.clone()]);
    assert!(matches!(
        engine.plan_execution(&pe).await,
        Err(EngineError::PlanExecutionNotFound(_))
    ));
    assert!(engine.node_executions(&pe).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_sweeper_runs_in_background() {
    let config = EngineConfig {
        timeout_sweep_interval_ms: 10,
        ..EngineConfig::default()
    };
    let engine = builder().with_config(config).build();
    let plan = PlanBuilder::new("sweeper")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-sweep"}))
        .with_timeout("ABSOLUTE", json!({"timeoutMs": 20}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    let sweeper = engine.spawn_timeout_sweeper();
    assert_eq!(finish(&engine, &pe).await, Status::Expired);
    sweeper.abort();
}

#[tokio::test]
async fn test_abort_all_stops_every_branch() {
    let dispatcher = Arc::new(RecordingTaskDispatcher::new());
    let engine = builder().with_dispatcher(dispatcher.clone()).build();
    let plan = PlanBuilder::new("abort-all")
        .add_node("fork", "FORK")
        .with_parameters(json!({"children": ["left", "right"]}))
        .with_children(["left", "right"])
        .then("never")
        .add_node("left", "WAIT")
        .with_parameters(json!({"callbackId": "cb-left"}))
        .add_node("right", "TASK")
        .with_parameters(json!({"script": "sleep 600"}))
        .add_node("never", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    node_in(&engine, &pe, "left", Status::AsyncWaiting).await;
    node_in(&engine, &pe, "right", Status::TaskWaiting).await;

    let interrupt = engine
        .interrupt(Interrupt::new(InterruptType::AbortAll, &pe))
        .await
        .unwrap();
    assert_eq!(interrupt.state, InterruptState::Processed);
    assert_eq!(finish(&engine, &pe).await, Status::Aborted);

    let nodes = engine.node_executions(&pe).await.unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status == Status::Aborted));
    assert_eq!(dispatcher.aborted().len(), 1);
    let late = engine.notify("cb-left", json!({})).await.unwrap();
    assert!(matches!(late, NotifyOutcome::Duplicate | NotifyOutcome::Buffered));
    let left = node_in(&engine, &pe, "left", Status::Aborted).await;
    assert!(left.pending_responses.is_empty());
}

#[tokio::test]
async fn test_retry_interrupt_reruns_parked_node() {
    let engine = builder().build();
    let plan = PlanBuilder::new("operator-retry")
        .add_node("deploy", "FAIL")
        .with_adviser("MANUAL_INTERVENTION", json!({}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let parked = node_in(&engine, &pe, "deploy", Status::InterventionWaiting).await;

    engine
        .interrupt(Interrupt::new(InterruptType::Retry, &pe).for_node(&parked.id))
        .await
        .unwrap();
    let rerun = node_of(&engine, &pe, "deploy", |n| {
        n.retry_count == 1 && n.status == Status::InterventionWaiting
    })
    .await;
    assert_eq!(rerun.retry_ids, vec![parked.id.clone()]);

    let old = engine.node_execution(&parked.id).await.unwrap();
    assert_eq!(old.status, Status::Failed);
    assert!(old.old_retry);

    engine
        .interrupt(Interrupt::new(InterruptType::Ignore, &pe).for_node(&rerun.id))
        .await
        .unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    assert_eq!(
        engine.node_execution(&rerun.id).await.unwrap().status,
        Status::IgnoreFailed
    );
}

#[tokio::test]
async fn test_response_before_wait_is_claimed() {
    init_logging();
    let slot: Arc<parking_lot::Mutex<Option<OrchestrationEngine>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let outcomes: Arc<parking_lot::Mutex<Vec<NotifyOutcome>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (engine_slot, seen) = (Arc::clone(&slot), Arc::clone(&outcomes));
    let engine = builder()
        .with_callback_step("FAST", ExecutionMode::Async, move |_ambiance, params| {
            let engine = engine_slot.lock().clone();
            let seen = Arc::clone(&seen);
            async move {
                let callback = callback_id(&params);
                // The work answers before the step hands back its callback id.
                if let Some(engine) = engine {
                    let outcome = engine.notify(&callback, json!({"fast": true})).await?;
                    seen.lock().push(outcome);
                }
                Ok(ExecutableResponse::Async {
                    callback_ids: vec![callback],
                })
            }
        })
        .build();
    *slot.lock() = Some(engine.clone());

    let plan = PlanBuilder::new("fast")
        .add_node("fast", "FAST")
        .with_parameters(json!({"callbackId": "cb-fast"}))
        .then("after")
        .add_node("after", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    assert_eq!(*outcomes.lock(), vec![NotifyOutcome::Buffered]);
    let fast = node_in(&engine, &pe, "fast", Status::Succeeded).await;
    assert_eq!(fast.output, json!({"cb-fast": {"fast": true}}));
    node_in(&engine, &pe, "after", Status::Succeeded).await;

    slot.lock().take();
}

#[tokio::test]
async fn test_finished_execution_releases_state() {
    let engine = builder().build();
    let plan = PlanBuilder::new("release")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-rel"}))
        .with_timeout("ACTIVE", json!({"timeoutMs": 60_000}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;
    assert!(engine.find_runtime(&pe).is_some());

    engine.notify("cb-rel", json!({"ok": true})).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
    released(&engine, &pe).await;
    assert!(engine.inner.runtimes.read().is_empty());

    // Later calls work from the repository alone.
    assert_eq!(engine.wait_for_plan(&pe).await.unwrap(), Status::Succeeded);
    assert_eq!(
        engine
            .sweep_timeouts(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        engine.notify("cb-rel", json!({"ok": false})).await.unwrap(),
        NotifyOutcome::Buffered
    );
}

#[tokio::test]
async fn test_unreachable_deadline_never_fires() {
    let engine = builder().build();
    let plan = PlanBuilder::new("far")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-far"}))
        .with_timeout("ABSOLUTE", json!({"timeoutMs": 9_000_000_000_000_000u64}))
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    node_in(&engine, &pe, "wait", Status::AsyncWaiting).await;

    let far_future = Utc::now() + chrono::Duration::days(365 * 100);
    assert_eq!(engine.sweep_timeouts(far_future).await.unwrap(), 0);

    engine.notify("cb-far", json!({"ok": true})).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
}

#[tokio::test]
async fn test_bad_timeout_parameters_reject_plan() {
    let engine = builder().build();
    let plan = PlanBuilder::new("bad-timeout")
        .add_node("wait", "WAIT")
        .with_parameters(json!({"callbackId": "cb-bad"}))
        .with_timeout("ABSOLUTE", json!({"timeoutSecs": 5}))
        .build();

    match engine.start_plan(plan, abstractions()).await {
        Err(EngineError::InvalidPlan(errors)) => assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidTimeoutParameters { .. }))),
        other => panic!("Expected InvalidPlan, got {:?}", other),
    }
    assert!(engine.inner.runtimes.read().is_empty());
    assert!(engine.inner.plan_executions.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_min_zero_children_release_parent_at_fan_out() {
    let engine = builder().build();
    let plan = PlanBuilder::new("background")
        .add_node("fork", "FORK")
        .with_parameters(json!({"children": ["bg"], "min": 0}))
        .with_children(["bg"])
        .then("after")
        .add_node("bg", "WAIT")
        .with_parameters(json!({"callbackId": "cb-bg"}))
        .add_node("after", "OK")
        .build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();

    let fork = node_in(&engine, &pe, "fork", Status::Succeeded).await;
    assert!(fork.children_resolved);
    node_in(&engine, &pe, "after", Status::Succeeded).await;
    node_in(&engine, &pe, "bg", Status::AsyncWaiting).await;

    engine.notify("cb-bg", json!({"ok": true})).await.unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Succeeded);
}

#[tokio::test]
async fn test_step_returning_after_abort_leaves_node_untouched() {
    let engine = builder()
        .with_callback_step("SLOW", ExecutionMode::Sync, |_ambiance, params| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ExecutableResponse::Sync(StepResponse::success(params)))
        })
        .build();
    let plan = PlanBuilder::new("slow-sync").add_node("slow", "SLOW").build();
    let pe = engine.start_plan(plan, abstractions()).await.unwrap();
    let running = node_of(&engine, &pe, "slow", |n| {
        n.status == Status::Running && n.mode.is_some()
    })
    .await;

    engine
        .interrupt(Interrupt::new(InterruptType::Abort, &pe).for_node(&running.id))
        .await
        .unwrap();
    assert_eq!(finish(&engine, &pe).await, Status::Aborted);
    let aborted = engine.node_execution(&running.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = engine.node_execution(&running.id).await.unwrap();
    assert_eq!(after.status, Status::Aborted);
    assert!(after.executable_responses.is_empty());
    assert_eq!(after.version, aborted.version);
}
