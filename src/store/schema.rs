//! Key layout shared by task writers, executors and the converger.

pub const TASK_SCHEMA_ROOT: &str = "/v1/task";
pub const EXECUTOR_SCHEMA_ROOT: &str = "/v1/executor";

pub fn task_schema_path(task_guid: &str) -> String {
    format!("{}/{}", TASK_SCHEMA_ROOT, task_guid)
}

pub fn executor_schema_path(executor_id: &str) -> String {
    format!("{}/{}", EXECUTOR_SCHEMA_ROOT, executor_id)
}
