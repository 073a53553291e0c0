//! One full convergence pass over the task subtree.
//!
//! The sweep:
//! 1. Lists every task record and every executor presence record
//! 2. Deletes records that cannot be parsed as tasks
//! 3. Fails pending tasks nobody claimed within `time_to_claim`
//! 4. Fails claimed or running tasks whose executor has disappeared
//! 5. Demotes claimed tasks to pending and resolving tasks to completed once
//!    they have been quiet for `convergence_interval`
//! 6. Kicks (rewrites unchanged) pending and completed tasks that have been
//!    quiet for `convergence_interval`, so watchers see them again
//!
//! The two listings are not taken atomically. An executor that appears or
//! vanishes between them can be misjudged for one pass; the next pass reads
//! both again and settles it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{elapsed_at_least, Clock};
use crate::core::task::{REASON_EXECUTOR_DISAPPEARED, REASON_NOT_CLAIMED};
use crate::core::{ExecutorPresence, Liveness, Task, TaskState};
use crate::log::{self, LogLevel};
use crate::store::schema::{EXECUTOR_SCHEMA_ROOT, TASK_SCHEMA_ROOT};
use crate::store::{StoreSnapshot, VersionedStore};

use super::barrier::WriteBarrier;
use super::events::{ConvergeEvent, EventSink, SweepReport};

/// What the sweep decided to do with one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    /// Move to `Completed` with the failure flag and this reason.
    Fail(&'static str),
    /// Back to `Pending`, assignment cleared.
    DemoteToPending,
    /// Back to `Completed`, resolution cancelled.
    DemoteToCompleted,
    /// Rewrite unchanged to refresh `updated_at`.
    Kick,
}

impl TaskAction {
    pub fn apply(&self, task: Task) -> Task {
        match self {
            TaskAction::Fail(reason) => task.mark_failed(reason),
            TaskAction::DemoteToPending => task.demote_to_pending(),
            TaskAction::DemoteToCompleted => task.demote_to_completed(),
            TaskAction::Kick => task,
        }
    }
}

/// A version-guarded replacement for one task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub key: String,
    /// Version the record had when it was listed.
    pub version: u64,
    pub prior_state: TaskState,
    /// Executor the task was assigned to when listed.
    pub prior_executor: String,
    pub action: TaskAction,
    pub task: Task,
}

/// A record under the task root that is not a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub key: String,
    pub value: String,
    pub error: String,
}

/// Everything a pass intends to change.
#[derive(Debug, Clone, Default)]
pub struct SweepPlan {
    pub inspected: usize,
    pub malformed: Vec<MalformedRecord>,
    pub corrections: Vec<Correction>,
}

impl SweepPlan {
    pub fn deletions(&self) -> Vec<String> {
        self.malformed.iter().map(|m| m.key.clone()).collect()
    }

    fn count(&self, matches: impl Fn(&TaskAction) -> bool) -> usize {
        self.corrections.iter().filter(|c| matches(&c.action)).count()
    }
}

/// Decide the action for a single task, if any.
///
/// Executor disappearance is checked before staleness, so a claimed or
/// running task on a dead executor is always failed rather than demoted.
pub fn decide(
    task: &Task,
    now: DateTime<Utc>,
    liveness: &impl Liveness,
    time_to_claim: Duration,
    convergence_interval: Duration,
) -> Option<TaskAction> {
    let should_kick = elapsed_at_least(now, task.updated_at, convergence_interval);

    match task.state {
        TaskState::Pending => {
            if elapsed_at_least(now, task.created_at, time_to_claim) {
                Some(TaskAction::Fail(REASON_NOT_CLAIMED))
            } else if should_kick {
                Some(TaskAction::Kick)
            } else {
                None
            }
        }
        TaskState::Claimed => {
            if !liveness.is_alive(&task.executor_id) {
                Some(TaskAction::Fail(REASON_EXECUTOR_DISAPPEARED))
            } else if should_kick {
                Some(TaskAction::DemoteToPending)
            } else {
                None
            }
        }
        TaskState::Running => {
            if !liveness.is_alive(&task.executor_id) {
                Some(TaskAction::Fail(REASON_EXECUTOR_DISAPPEARED))
            } else {
                None
            }
        }
        TaskState::Completed => should_kick.then_some(TaskAction::Kick),
        TaskState::Resolving => should_kick.then_some(TaskAction::DemoteToCompleted),
    }
}

/// Work out deletions and corrections for one listing of the task subtree.
pub fn plan_sweep(
    tasks: &StoreSnapshot,
    liveness: &impl Liveness,
    now: DateTime<Utc>,
    time_to_claim: Duration,
    convergence_interval: Duration,
) -> SweepPlan {
    let mut plan = SweepPlan {
        inspected: tasks.len(),
        ..Default::default()
    };

    for node in tasks.iter() {
        let task = match Task::from_json(&node.value) {
            Ok(task) => task,
            Err(err) => {
                plan.malformed.push(MalformedRecord {
                    key: node.key.clone(),
                    value: String::from_utf8_lossy(&node.value).into_owned(),
                    error: err.to_string(),
                });
                continue;
            }
        };

        if let Some(action) = decide(&task, now, liveness, time_to_claim, convergence_interval) {
            plan.corrections.push(Correction {
                key: node.key.clone(),
                version: node.version,
                prior_state: task.state,
                prior_executor: task.executor_id.clone(),
                task: action.apply(task),
                action,
            });
        }
    }

    plan
}

/// Runs convergence passes against a store.
#[derive(Clone)]
pub struct ConvergenceSweep {
    store: Arc<dyn VersionedStore>,
    barrier: WriteBarrier,
    events: EventSink,
}

impl ConvergenceSweep {
    pub fn new(store: Arc<dyn VersionedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            barrier: WriteBarrier::new(Arc::clone(&store), clock),
            store,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.barrier = self.barrier.with_events(events.clone());
        self.events = events;
        self
    }

    /// Run one pass as of `now`.
    ///
    /// Returns once every deletion and correction has been attempted. A
    /// failed listing leaves the store untouched and yields an aborted report.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        time_to_claim: Duration,
        convergence_interval: Duration,
    ) -> SweepReport {
        let tasks = match self.store.list_recursively(TASK_SCHEMA_ROOT).await {
            Ok(tasks) => tasks,
            Err(err) => {
                let level = if err.is_not_found() {
                    LogLevel::Debug
                } else {
                    LogLevel::Error
                };
                log::event(level, "task.converge.list-tasks-failed", &[("error", &err)]);
                self.events.emit(ConvergeEvent::SweepAborted { error: err });
                return SweepReport::aborted();
            }
        };

        let presence = match self.store.list_recursively(EXECUTOR_SCHEMA_ROOT).await {
            Ok(executors) => ExecutorPresence::from_snapshot(&executors),
            Err(err) if err.is_not_found() => ExecutorPresence::empty(),
            Err(err) => {
                log::event(
                    LogLevel::Error,
                    "task.converge.list-executors-failed",
                    &[("error", &err)],
                );
                self.events.emit(ConvergeEvent::SweepAborted { error: err });
                return SweepReport::aborted();
            }
        };

        let plan = plan_sweep(&tasks, &presence, now, time_to_claim, convergence_interval);
        self.record(&plan);

        let mut report = SweepReport {
            inspected: plan.inspected,
            kicked: plan.count(|a| *a == TaskAction::Kick),
            demoted: plan.count(|a| {
                matches!(a, TaskAction::DemoteToPending | TaskAction::DemoteToCompleted)
            }),
            failed: plan.count(|a| matches!(a, TaskAction::Fail(_))),
            ..Default::default()
        };

        let deletions = plan.deletions();
        if !deletions.is_empty() {
            match self.store.delete_keys(&deletions).await {
                Ok(()) => report.malformed_deleted = deletions.len(),
                Err(err) => {
                    log::event(
                        LogLevel::Error,
                        "task.converge.failed-to-delete",
                        &[("keys", &deletions.len()), ("error", &err)],
                    );
                    self.events.emit(ConvergeEvent::DeleteFailed {
                        keys: deletions,
                        error: err,
                    });
                }
            }
        }

        let writes = self.barrier.apply(plan.corrections).await;
        report.writes_succeeded = writes.succeeded;
        report.writes_conflicted = writes.conflicted;
        report.writes_failed = writes.failed;

        log::event(
            LogLevel::Debug,
            "task.converge.complete",
            &[
                ("inspected", &report.inspected),
                ("kicked", &report.kicked),
                ("demoted", &report.demoted),
                ("failed", &report.failed),
                ("deleted", &report.malformed_deleted),
                ("conflicts", &report.writes_conflicted),
            ],
        );
        self.events.emit(ConvergeEvent::SweepCompleted(report));
        report
    }

    fn record(&self, plan: &SweepPlan) {
        for malformed in &plan.malformed {
            log::event(
                LogLevel::Error,
                "task.converge.json-parse-failure",
                &[
                    ("key", &malformed.key),
                    ("value", &malformed.value),
                    ("error", &malformed.error),
                ],
            );
            self.events.emit(ConvergeEvent::MalformedRecord {
                key: malformed.key.clone(),
                error: malformed.error.clone(),
            });
        }

        for correction in &plan.corrections {
            let guid = correction.task.task_guid.clone();
            match &correction.action {
                TaskAction::Fail(reason) => {
                    let name = if *reason == REASON_NOT_CLAIMED {
                        "task.converge.failed-to-claim"
                    } else {
                        "task.converge.executor-disappeared"
                    };
                    log::event(
                        LogLevel::Error,
                        name,
                        &[
                            ("task_guid", &guid),
                            ("state", &correction.prior_state),
                            ("executor_id", &correction.prior_executor),
                        ],
                    );
                    self.events.emit(ConvergeEvent::TaskFailed {
                        task_guid: guid,
                        prior_state: correction.prior_state,
                        reason: reason.to_string(),
                    });
                }
                TaskAction::DemoteToPending | TaskAction::DemoteToCompleted => {
                    let name = if correction.action == TaskAction::DemoteToPending {
                        "task.converge.failed-to-start"
                    } else {
                        "task.converge.failed-to-resolve"
                    };
                    log::event(LogLevel::Error, name, &[("task_guid", &guid)]);
                    self.events.emit(ConvergeEvent::TaskDemoted {
                        task_guid: guid,
                        from: correction.prior_state,
                        to: correction.task.state,
                    });
                }
                TaskAction::Kick => {
                    log::event(
                        LogLevel::Debug,
                        "task.converge.kicked",
                        &[("task_guid", &guid), ("state", &correction.task.state)],
                    );
                    self.events.emit(ConvergeEvent::TaskKicked {
                        task_guid: guid,
                        state: correction.task.state,
                    });
                }
            }
        }
    }
}
