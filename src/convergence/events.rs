//! Observational events emitted while converging.
//!
//! Nothing in the converger reads these back; they exist so operators and
//! tests can see exactly which repairs a sweep made.

use tokio::sync::mpsc;

use crate::core::TaskState;
use crate::store::StoreError;

/// Events emitted by the sweep, the write barrier and the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvergeEvent {
    /// A task was scheduled to be force-terminated.
    TaskFailed {
        task_guid: String,
        prior_state: TaskState,
        reason: String,
    },
    /// A stalled task was scheduled to move back to an earlier state.
    TaskDemoted {
        task_guid: String,
        from: TaskState,
        to: TaskState,
    },
    /// A quiet task was scheduled to be rewritten unchanged.
    TaskKicked { task_guid: String, state: TaskState },
    /// An unparseable record was scheduled for deletion.
    MalformedRecord { key: String, error: String },
    /// The batch delete of malformed records failed.
    DeleteFailed { keys: Vec<String>, error: StoreError },
    /// A correction lost its compare-and-swap or could not be written.
    CompareAndSwapFailed { key: String, error: String },
    /// The initial listings failed; nothing was changed.
    SweepAborted { error: StoreError },
    /// A sweep ran to completion.
    SweepCompleted(SweepReport),
    /// A sibling reconciler returned an error or panicked.
    ReconcilerFailed { name: String, message: String },
}

/// Counts of what a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Task records inspected, malformed ones included.
    pub inspected: usize,
    pub kicked: usize,
    pub demoted: usize,
    pub failed: usize,
    pub malformed_deleted: usize,
    pub writes_succeeded: usize,
    pub writes_conflicted: usize,
    pub writes_failed: usize,
    /// The pass stopped before touching the store.
    pub aborted: bool,
}

impl SweepReport {
    pub fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    /// Number of corrections handed to the write barrier.
    pub fn corrections(&self) -> usize {
        self.kicked + self.demoted + self.failed
    }

    /// Whether the sweep found nothing to change.
    pub fn is_quiet(&self) -> bool {
        !self.aborted && self.corrections() == 0 && self.malformed_deleted == 0
    }
}

/// Optional destination for [`ConvergeEvent`]s.
///
/// Sends never block and a closed receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ConvergeEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ConvergeEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ConvergeEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
