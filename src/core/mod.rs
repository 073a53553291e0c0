//! Domain records the converger reasons about: tasks and executor presence.

pub mod presence;
pub mod task;

pub use presence::{ExecutorPresence, Liveness};
pub use task::{Task, TaskParseError, TaskState};
