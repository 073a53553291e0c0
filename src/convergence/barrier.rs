//! Concurrent compare-and-swap of sweep corrections.
//!
//! Every correction is written from its own spawned task and the barrier
//! joins all of them before returning, so a batch costs roughly one store
//! round trip rather than one per correction. Corrections are independent:
//! each is guarded by the version it was listed at, so the order they land
//! in does not matter and a stale one simply loses.

use std::sync::Arc;

use futures::future::join_all;

use crate::clock::{unix_nanos, Clock};
use crate::log::{self, LogLevel};
use crate::store::{StoreError, VersionedStore};

use super::events::{ConvergeEvent, EventSink};
use super::sweep::Correction;

/// Outcome of one correction.
#[derive(Debug)]
enum WriteOutcome {
    Written,
    Lost(StoreError),
    Failed(String),
}

/// Counts from one [`WriteBarrier::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierReport {
    pub succeeded: usize,
    /// Lost to a concurrent writer or a deleted record.
    pub conflicted: usize,
    /// Serialization, connectivity or join failures.
    pub failed: usize,
}

impl BarrierReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.conflicted + self.failed
    }
}

/// Applies batches of corrections against a store.
#[derive(Clone)]
pub struct WriteBarrier {
    store: Arc<dyn VersionedStore>,
    clock: Arc<dyn Clock>,
    events: EventSink,
}

impl WriteBarrier {
    pub fn new(store: Arc<dyn VersionedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Attempt every correction once and wait for all of them.
    ///
    /// Failed writes are logged and counted; they are never retried and
    /// never undo the writes that did land.
    pub async fn apply(&self, corrections: Vec<Correction>) -> BarrierReport {
        if corrections.is_empty() {
            return BarrierReport::default();
        }

        let keys: Vec<String> = corrections.iter().map(|c| c.key.clone()).collect();
        let handles: Vec<_> = corrections
            .into_iter()
            .map(|correction| {
                let store = Arc::clone(&self.store);
                let Correction {
                    key,
                    version,
                    mut task,
                    ..
                } = correction;
                task.updated_at = unix_nanos(self.clock.now()).max(task.created_at);

                tokio::spawn(async move {
                    let value = match task.to_json() {
                        Ok(value) => value,
                        Err(err) => return WriteOutcome::Failed(err.to_string()),
                    };
                    match store
                        .compare_and_swap_by_version(version, &key, value)
                        .await
                    {
                        Ok(_) => WriteOutcome::Written,
                        Err(err) if err.is_conflict() => WriteOutcome::Lost(err),
                        Err(err) => WriteOutcome::Failed(err.to_string()),
                    }
                })
            })
            .collect();

        let mut report = BarrierReport::default();
        for (key, result) in keys.into_iter().zip(join_all(handles).await) {
            let error = match result {
                Ok(WriteOutcome::Written) => {
                    report.succeeded += 1;
                    continue;
                }
                Ok(WriteOutcome::Lost(err)) => {
                    report.conflicted += 1;
                    err.to_string()
                }
                Ok(WriteOutcome::Failed(message)) => {
                    report.failed += 1;
                    message
                }
                Err(join_err) => {
                    report.failed += 1;
                    join_err.to_string()
                }
            };

            log::event(
                LogLevel::Error,
                "task.converge.failed-to-compare-and-swap",
                &[("key", &key), ("error", &error)],
            );
            self.events
                .emit(ConvergeEvent::CompareAndSwapFailed { key, error });
        }

        report
    }
}
