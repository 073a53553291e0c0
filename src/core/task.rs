//! Task record model.
//!
//! Tasks are created by requesters in `Pending`, claimed and run by
//! executors, and eventually resolved by an external resolver. The converger
//! only ever rewrites a task through the transitions defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::unix_nanos;

pub const REASON_NOT_CLAIMED: &str = "not claimed within time limit";
pub const REASON_EXECUTOR_DISAPPEARED: &str = "executor disappeared before completion";

/// Task state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an executor to claim it.
    Pending,
    /// Reserved by an executor that has not started it yet.
    Claimed,
    /// Executing on an executor.
    Running,
    /// Finished, successfully or not; waiting for a resolver.
    Completed,
    /// A resolver is processing the result.
    Resolving,
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Claimed => write!(f, "claimed"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Resolving => write!(f, "resolving"),
        }
    }
}

/// Why a stored value could not be read as a task.
#[derive(Error, Debug)]
pub enum TaskParseError {
    #[error("invalid task JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task has an empty guid")]
    MissingGuid,
}

/// A unit of work as stored under the task schema root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_guid: String,
    #[serde(default)]
    pub stack: String,
    pub state: TaskState,
    /// Unix nanoseconds.
    pub created_at: i64,
    /// Unix nanoseconds.
    pub updated_at: i64,
    #[serde(default)]
    pub executor_id: String,
    #[serde(default)]
    pub container_handle: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

impl Task {
    /// Create a pending task with a fresh guid, stamped at `now`.
    pub fn new(stack: &str, now: DateTime<Utc>) -> Self {
        Self::with_guid(&Uuid::new_v4().to_string(), stack, now)
    }

    pub fn with_guid(task_guid: &str, stack: &str, now: DateTime<Utc>) -> Self {
        let stamp = unix_nanos(now);
        Self {
            task_guid: task_guid.to_string(),
            stack: stack.to_string(),
            state: TaskState::Pending,
            created_at: stamp,
            updated_at: stamp,
            executor_id: String::new(),
            container_handle: String::new(),
            failed: false,
            failure_reason: String::new(),
            result: String::new(),
            annotation: None,
            memory_mb: 0,
            disk_mb: 0,
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, TaskParseError> {
        let task: Task = serde_json::from_slice(bytes)?;
        if task.task_guid.is_empty() {
            return Err(TaskParseError::MissingGuid);
        }
        Ok(task)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Force-terminate: `Completed` with the failure flag and reason set.
    ///
    /// Only claimed and running tasks carry an assignment, so it is cleared.
    pub fn mark_failed(mut self, reason: &str) -> Self {
        self.state = TaskState::Completed;
        self.failed = true;
        self.failure_reason = reason.to_string();
        self.executor_id.clear();
        self.container_handle.clear();
        self
    }

    /// Return a stalled claim to the pending pool.
    pub fn demote_to_pending(mut self) -> Self {
        self.state = TaskState::Pending;
        self.executor_id.clear();
        self.container_handle.clear();
        self
    }

    /// Cancel a stalled resolution.
    pub fn demote_to_completed(mut self) -> Self {
        self.state = TaskState::Completed;
        self
    }

    /// Whether the task is currently assigned to an executor.
    pub fn is_assigned(&self) -> bool {
        matches!(self.state, TaskState::Claimed | TaskState::Running)
    }
}
