//! Single-sweep outcomes for each task state.

use converger::convergence::ConvergeEvent;
use converger::core::task::{REASON_EXECUTOR_DISAPPEARED, REASON_NOT_CLAIMED};
use converger::TaskState;

use crate::fixtures::{assigned_task, task, Harness};

/// Test: Pending task past its claim deadline is failed
#[tokio::test]
async fn test_unclaimed_pending_task_is_failed() {
    let harness = Harness::new();
    harness
        .put_task(&task("task-a", TaskState::Pending, 40, 40))
        .await;

    let report = harness.sweep().await;

    let stored = harness.task("task-a").await;
    assert_eq!(stored.state, TaskState::Completed);
    assert!(stored.failed);
    assert_eq!(stored.failure_reason, REASON_NOT_CLAIMED);
    assert_eq!(report.failed, 1);
    assert_eq!(report.writes_succeeded, 1);
}

/// Test: Claimed task whose executor vanished is failed even before it is due a kick
#[tokio::test]
async fn test_claimed_task_with_missing_executor_is_failed() {
    let harness = Harness::new();
    harness.add_executor("exec-other").await;
    harness
        .put_task(&assigned_task("task-b", TaskState::Claimed, "exec-1", 5, 5))
        .await;

    harness.sweep().await;

    let stored = harness.task("task-b").await;
    assert_eq!(stored.state, TaskState::Completed);
    assert!(stored.failed);
    assert_eq!(stored.failure_reason, REASON_EXECUTOR_DISAPPEARED);
    assert_eq!(stored.executor_id, "");
    assert_eq!(stored.container_handle, "");
}

/// Test: Stale claim on a live executor goes back to pending
#[tokio::test]
async fn test_stale_claim_is_demoted_to_pending() {
    let harness = Harness::new();
    harness.add_executor("exec-2").await;
    harness
        .put_task(&assigned_task("task-c", TaskState::Claimed, "exec-2", 15, 15))
        .await;

    let report = harness.sweep().await;

    let stored = harness.task("task-c").await;
    assert_eq!(stored.state, TaskState::Pending);
    assert_eq!(stored.executor_id, "");
    assert_eq!(stored.container_handle, "");
    assert!(!stored.failed);
    assert_eq!(report.demoted, 1);
}

/// Test: Stalled resolution is cancelled back to completed
#[tokio::test]
async fn test_stale_resolving_task_is_demoted_to_completed() {
    let harness = Harness::new();
    let mut resolving = task("task-d", TaskState::Resolving, 60, 20);
    resolving.result = "exit 0".to_string();
    harness.put_task(&resolving).await;

    harness.sweep().await;

    let stored = harness.task("task-d").await;
    assert_eq!(stored.state, TaskState::Completed);
    assert_eq!(stored.result, "exit 0");
    assert!(!stored.failed);
    assert_eq!(stored.created_at, resolving.created_at);
}

/// Test: Running task on a live executor is never demoted for staleness
#[tokio::test]
async fn test_stale_running_task_is_left_alone() {
    let harness = Harness::new();
    harness.add_executor("exec-3").await;
    let running = assigned_task("task-e", TaskState::Running, "exec-3", 200, 100);
    harness.put_task(&running).await;
    let version = harness.version("task-e").await;

    let report = harness.sweep().await;

    assert_eq!(harness.task("task-e").await, running);
    assert_eq!(harness.version("task-e").await, version);
    assert!(report.is_quiet());
}

/// Test: Unparseable record is deleted and the deletion is reported
#[tokio::test]
async fn test_malformed_record_is_deleted() {
    let mut harness = Harness::new();
    harness.put_raw("/v1/task/garbage", "ß{not json").await;

    let report = harness.sweep().await;

    assert!(!harness.store.contains("/v1/task/garbage").await);
    assert_eq!(report.malformed_deleted, 1);
    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        ConvergeEvent::MalformedRecord { key, .. } if key == "/v1/task/garbage"
    )));
}

/// Test: Malformed records go regardless of age or shape
#[tokio::test]
async fn test_all_malformed_shapes_are_deleted() {
    let harness = Harness::new();
    harness.put_raw("/v1/task/empty", "").await;
    harness
        .put_raw(
            "/v1/task/no-guid",
            r#"{"task_guid":"","state":"pending","created_at":0,"updated_at":0}"#,
        )
        .await;
    harness
        .put_raw(
            "/v1/task/bad-state",
            r#"{"task_guid":"x","state":"lost","created_at":0,"updated_at":0}"#,
        )
        .await;
    harness
        .put_task(&task("healthy", TaskState::Pending, 1, 1))
        .await;

    let report = harness.sweep().await;

    assert_eq!(report.malformed_deleted, 3);
    assert_eq!(report.inspected, 4);
    assert_eq!(harness.store.dump().await.len(), 1);
    assert_eq!(harness.task("healthy").await.state, TaskState::Pending);
}

/// Test: A dead executor wins over staleness for both claimed and running tasks
#[tokio::test]
async fn test_executor_liveness_takes_precedence_over_kick() {
    let mut harness = Harness::new();
    harness.add_executor("exec-live").await;
    harness
        .put_task(&assigned_task("claimed", TaskState::Claimed, "exec-dead", 120, 120))
        .await;
    harness
        .put_task(&assigned_task("running", TaskState::Running, "exec-dead", 120, 120))
        .await;

    let report = harness.sweep().await;

    for guid in ["claimed", "running"] {
        let stored = harness.task(guid).await;
        assert_eq!(stored.state, TaskState::Completed);
        assert!(stored.failed);
        assert_eq!(stored.failure_reason, REASON_EXECUTOR_DISAPPEARED);
        assert!(stored.executor_id.is_empty());
        assert!(stored.container_handle.is_empty());
    }
    assert_eq!(report.failed, 2);
    assert_eq!(report.demoted, 0);
    assert!(!harness
        .drain_events()
        .iter()
        .any(|e| matches!(e, ConvergeEvent::TaskDemoted { .. })));
}

/// Test: A missing executor subtree means no executor is alive
#[tokio::test]
async fn test_missing_executor_root_means_nobody_is_alive() {
    let harness = Harness::new();
    harness
        .put_task(&assigned_task("running", TaskState::Running, "exec-1", 5, 5))
        .await;

    let report = harness.sweep().await;

    assert!(!report.aborted);
    assert!(harness.task("running").await.failed);
}

/// Test: Kicks rewrite the value with a fresh timestamp and nothing else
#[tokio::test]
async fn test_kick_refreshes_updated_at_only() {
    let mut harness = Harness::new();
    let pending = task("pending", TaskState::Pending, 12, 12);
    let completed = task("completed", TaskState::Completed, 90, 60);
    harness.put_task(&pending).await;
    harness.put_task(&completed).await;
    let pending_version = harness.version("pending").await;

    let report = harness.sweep().await;

    assert_eq!(report.kicked, 2);
    let now_nanos = converger::clock::unix_nanos(crate::fixtures::now());
    for original in [pending, completed] {
        let stored = harness.task(&original.task_guid).await;
        assert_eq!(stored.updated_at, now_nanos);
        let mut expected = original.clone();
        expected.updated_at = now_nanos;
        assert_eq!(stored, expected);
    }
    assert!(harness.version("pending").await > pending_version);

    let kicked = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ConvergeEvent::TaskKicked { .. }))
        .count();
    assert_eq!(kicked, 2);
}

/// Test: A second sweep straight after the first changes nothing
#[tokio::test]
async fn test_back_to_back_sweeps_are_idempotent() {
    let harness = Harness::new();
    harness.add_executor("exec-2").await;
    harness.add_executor("exec-3").await;
    harness
        .put_task(&task("a", TaskState::Pending, 40, 40))
        .await;
    harness
        .put_task(&assigned_task("b", TaskState::Claimed, "exec-1", 5, 5))
        .await;
    harness
        .put_task(&assigned_task("c", TaskState::Claimed, "exec-2", 15, 15))
        .await;
    harness
        .put_task(&task("d", TaskState::Resolving, 60, 20))
        .await;
    harness
        .put_task(&assigned_task("e", TaskState::Running, "exec-3", 100, 100))
        .await;
    harness.put_raw("/v1/task/k", "nope").await;

    let first = harness.sweep().await;
    assert_eq!(first.corrections(), 4);
    let after_first = harness.store.dump().await;

    let second = harness.sweep().await;

    assert!(second.is_quiet());
    assert_eq!(harness.store.dump().await, after_first);
}

/// Test: Every transition stays inside the table for its prior state
#[tokio::test]
async fn test_transitions_stay_within_table() {
    let harness = Harness::new();
    harness.add_executor("live").await;
    let states = [
        TaskState::Pending,
        TaskState::Claimed,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Resolving,
    ];
    let ages = [0, 5, 10, 29, 30, 45];
    let executors = ["live", "dead"];

    let mut seeded = Vec::new();
    for state in states {
        for age in ages {
            for executor in executors {
                let guid = format!("{}-{}-{}", state, age, executor);
                let t = if matches!(state, TaskState::Claimed | TaskState::Running) {
                    assigned_task(&guid, state, executor, age, age)
                } else {
                    task(&guid, state, age, age)
                };
                harness.put_task(&t).await;
                seeded.push(t);
            }
        }
    }

    harness.sweep().await;

    for before in seeded {
        let after = harness.task(&before.task_guid).await;
        let allowed: &[TaskState] = match before.state {
            TaskState::Pending => &[TaskState::Pending, TaskState::Completed],
            TaskState::Claimed => &[TaskState::Claimed, TaskState::Pending, TaskState::Completed],
            TaskState::Running => &[TaskState::Running, TaskState::Completed],
            TaskState::Completed => &[TaskState::Completed],
            TaskState::Resolving => &[TaskState::Resolving, TaskState::Completed],
        };
        assert!(
            allowed.contains(&after.state),
            "{} moved from {} to {}",
            before.task_guid,
            before.state,
            after.state
        );
        if after.state == TaskState::Completed && before.state != TaskState::Completed {
            let expect_failed = before.state != TaskState::Resolving;
            assert_eq!(after.failed, expect_failed, "{}", before.task_guid);
        }
        assert!(after.created_at <= after.updated_at);
        if !after.is_assigned() {
            assert!(after.executor_id.is_empty(), "{}", before.task_guid);
            assert!(after.container_handle.is_empty(), "{}", before.task_guid);
        }
    }
}
