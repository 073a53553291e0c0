//! Periodic convergence loop.
//!
//! The loop waits one full tick period before its first sweep: a process
//! that just took over the converge lock would otherwise repeat the sweep
//! the previous holder most likely just ran. After that it sweeps once per
//! period until cancelled. A sweep in flight when cancellation arrives runs
//! to completion; cancellation is only observed between ticks. Sibling
//! reconciler runs still going at shutdown are aborted.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::store::VersionedStore;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

use super::events::{ConvergeEvent, EventSink, SweepReport};
use super::reconciler::Reconciler;
use super::sweep::ConvergenceSweep;

/// Default time between sweeps.
pub const DEFAULT_TICK_PERIOD_SECS: u64 = 30;

/// Default age at which an unclaimed pending task is failed.
pub const DEFAULT_TIME_TO_CLAIM_SECS: u64 = 30 * 60;

/// Default quiet period before a task is kicked or demoted.
pub const DEFAULT_CONVERGENCE_INTERVAL_SECS: u64 = 30;

/// Durations that drive the loop and the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergerConfig {
    /// Time between sweeps.
    pub tick_period: Duration,
    /// Pending tasks older than this are failed.
    pub time_to_claim: Duration,
    /// Tasks quiet for this long are kicked, or demoted when claimed or resolving.
    pub convergence_interval: Duration,
}

impl Default for ConvergerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(DEFAULT_TICK_PERIOD_SECS),
            time_to_claim: Duration::from_secs(DEFAULT_TIME_TO_CLAIM_SECS),
            convergence_interval: Duration::from_secs(DEFAULT_CONVERGENCE_INTERVAL_SECS),
        }
    }
}

impl ConvergerConfig {
    pub fn with_tick_period(mut self, tick_period: Duration) -> Self {
        self.tick_period = tick_period;
        self
    }

    pub fn with_time_to_claim(mut self, time_to_claim: Duration) -> Self {
        self.time_to_claim = time_to_claim;
        self
    }

    pub fn with_convergence_interval(mut self, convergence_interval: Duration) -> Self {
        self.convergence_interval = convergence_interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_period.is_zero() {
            return Err(Error::Validation("tick period must be positive".to_string()));
        }
        if self.time_to_claim.is_zero() {
            return Err(Error::Validation("time to claim must be positive".to_string()));
        }
        if self.convergence_interval.is_zero() {
            return Err(Error::Validation(
                "convergence interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a converger loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Created,
            1 => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }
}

/// Owns one convergence loop and everything it needs.
pub struct Converger {
    config: ConvergerConfig,
    clock: Arc<dyn Clock>,
    sweep: ConvergenceSweep,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    /// Latest run of each reconciler, by registration order.
    sibling_runs: Mutex<Vec<Option<SiblingRun>>>,
    events: EventSink,
    state: Arc<AtomicU8>,
}

type SiblingRun = JoinHandle<Result<()>>;

impl Converger {
    /// Create a converger. Fails if any configured duration is zero.
    pub fn new(
        store: Arc<dyn VersionedStore>,
        clock: Arc<dyn Clock>,
        config: ConvergerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sweep: ConvergenceSweep::new(store, Arc::clone(&clock)),
            config,
            clock,
            reconcilers: Vec::new(),
            sibling_runs: Mutex::new(Vec::new()),
            events: EventSink::disabled(),
            state: Arc::new(AtomicU8::new(LoopState::Created as u8)),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.sweep = self.sweep.with_events(events.clone());
        self.events = events;
        self
    }

    /// Register a sibling reconciler to run on every tick.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self.sibling_runs
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(None);
        self
    }

    pub fn config(&self) -> &ConvergerConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Start every idle sibling reconciler, then run the task sweep.
    ///
    /// Siblings run on their own tasks and are not awaited here, so one that
    /// hangs or panics cannot hold up the sweep or later ticks. A sibling
    /// whose previous run is still going is skipped for this tick. Results
    /// of finished runs are reported when the next tick or shutdown picks
    /// them up.
    pub async fn tick(&self) -> SweepReport {
        let now = self.clock.now();
        self.start_siblings(now);

        self.sweep
            .run(
                now,
                self.config.time_to_claim,
                self.config.convergence_interval,
            )
            .await
    }

    fn start_siblings(&self, now: DateTime<Utc>) {
        let mut runs = self.sibling_runs.lock().unwrap_or_else(|e| e.into_inner());
        for (reconciler, slot) in self.reconcilers.iter().zip(runs.iter_mut()) {
            if let Some(run) = slot.as_mut() {
                let finished = if run.is_finished() {
                    run.now_or_never()
                } else {
                    None
                };
                match finished {
                    Some(result) => self.report_sibling(reconciler.as_ref(), result),
                    None => {
                        clog_warn!(
                            "converge.reconciler-still-running name={}",
                            reconciler.name()
                        );
                        continue;
                    }
                }
            }

            let reconciler = Arc::clone(reconciler);
            *slot = Some(tokio::spawn(async move { reconciler.reconcile(now).await }));
        }
    }

    /// Collect finished sibling runs and abort the ones still going.
    async fn stop_siblings(&self) {
        let leftovers: Vec<Option<SiblingRun>> = self
            .sibling_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter_mut()
            .map(Option::take)
            .collect();

        for (reconciler, run) in self.reconcilers.iter().zip(leftovers) {
            let Some(run) = run else { continue };
            if !run.is_finished() {
                clog_warn!("converge.reconciler-aborted name={}", reconciler.name());
                run.abort();
            }
            match run.await {
                Err(join_err) if join_err.is_cancelled() => {}
                result => self.report_sibling(reconciler.as_ref(), result),
            }
        }
    }

    fn report_sibling(
        &self,
        reconciler: &dyn Reconciler,
        result: std::result::Result<Result<()>, JoinError>,
    ) {
        let message = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(join_err) => Error::TaskJoin(join_err.to_string()).to_string(),
        };
        clog_error!(
            "converge.reconciler-failed name={} error={:?}",
            reconciler.name(),
            message
        );
        self.events.emit(ConvergeEvent::ReconcilerFailed {
            name: reconciler.name().to_string(),
            message,
        });
    }

    /// Move from `Created` to `Running`. Any other state refuses the start.
    fn claim_start(&self) -> bool {
        match self.state.compare_exchange(
            LoopState::Created as u8,
            LoopState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(current) => {
                clog_warn!(
                    "converge.start-refused state={:?}",
                    LoopState::from_u8(current)
                );
                false
            }
        }
    }

    /// Run the loop until `cancel` fires.
    ///
    /// A converger runs at most once: calling this while it is running or
    /// after it has stopped returns immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.claim_start() {
            self.run_started(cancel).await;
        }
    }

    async fn run_started(&self, cancel: CancellationToken) {
        clog!(
            "converge.started tick_period={:?} time_to_claim={:?} convergence_interval={:?}",
            self.config.tick_period,
            self.config.time_to_claim,
            self.config.convergence_interval
        );

        let period = self.config.tick_period;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    clog_debug!("converge.cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    clog_debug!(
                        "converge.tick aborted={} corrections={} deleted={}",
                        report.aborted,
                        report.corrections(),
                        report.malformed_deleted
                    );
                }
            }
        }

        self.stop_siblings().await;
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
        clog!("converge.stopped");
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> ConvergerHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let state = Arc::clone(&self.state);
        let started = self.claim_start();

        let task = tokio::spawn(async move {
            if started {
                self.run_started(cancel_clone).await;
            }
        });

        ConvergerHandle {
            cancel,
            state,
            task,
        }
    }
}

/// Handle to a spawned converger, used for graceful shutdown.
pub struct ConvergerHandle {
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl ConvergerHandle {
    /// Stop scheduling ticks. A sweep already running is allowed to finish;
    /// sibling runs still going are aborted.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Wait for the loop to stop.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))
    }

    /// Cancel and wait for the loop to stop.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}
