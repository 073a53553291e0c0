//! Task convergence for a distributed scheduler.
//!
//! Task records live in a shared versioned key-value store. Executors crash,
//! heartbeats get lost and writes get interrupted, so records drift away from
//! reality. The converger runs on a single elected process and periodically
//! sweeps every task, failing tasks whose executor vanished or that were never
//! claimed, demoting stalled claims and resolutions, and re-writing quiet
//! tasks so their watchers look at them again.

pub mod clock;
pub mod config;
pub mod convergence;
pub mod core;
pub mod error;
pub mod log;
pub mod store;

pub use clock::{Clock, FakeClock, SystemClock};
pub use convergence::{
    ConvergeEvent, ConvergenceSweep, Converger, ConvergerConfig, ConvergerHandle, EventSink,
    Reconciler, SweepReport, WriteBarrier,
};
pub use crate::core::{Task, TaskState};
pub use error::{Error, Result};
pub use store::{MemoryStore, StoreError, StoreNode, StoreSnapshot, VersionedStore};
