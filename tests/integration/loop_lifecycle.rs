//! Loop cadence, sibling reconcilers and shutdown, all under paused time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use converger::convergence::{ConvergeEvent, LoopState};
use converger::{
    Converger, ConvergerConfig, Error, EventSink, FakeClock, MemoryStore, Reconciler, Result,
    TaskState,
};

use crate::fixtures::{now, task, Harness, CONVERGENCE_INTERVAL, TIME_TO_CLAIM};

const TICK: Duration = Duration::from_secs(1);

fn config() -> ConvergerConfig {
    ConvergerConfig::default()
        .with_tick_period(TICK)
        .with_time_to_claim(TIME_TO_CLAIM)
        .with_convergence_interval(CONVERGENCE_INTERVAL)
}

fn converger(store: Arc<MemoryStore>) -> Converger {
    Converger::new(store, Arc::new(FakeClock::new(now())), config()).unwrap()
}

/// Sibling that records each call and can be told to fail, panic or stall.
#[derive(Default)]
struct Sibling {
    name: &'static str,
    calls: AtomicUsize,
    fail: bool,
    panic: bool,
    stall: Option<Duration>,
    finished: AtomicBool,
}

impl Sibling {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Reconciler for Sibling {
    fn name(&self) -> &str {
        self.name
    }

    async fn reconcile(&self, _now: DateTime<Utc>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.panic {
            panic!("{} blew up", self.name);
        }
        self.finished.store(true, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Reconcile {
                name: self.name.to_string(),
                message: "desired state unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ConvergeEvent>) -> Vec<ConvergeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Test: Nothing is repaired until a full period has elapsed
#[tokio::test(start_paused = true)]
async fn test_loop_repairs_after_first_period() {
    let harness = Harness::new();
    harness
        .put_task(&task("stale", TaskState::Pending, 40, 40))
        .await;

    let handle = converger(harness.store.clone()).spawn();

    tokio::time::sleep(TICK / 2).await;
    assert_eq!(harness.task("stale").await.state, TaskState::Pending);

    tokio::time::sleep(TICK).await;
    let repaired = harness.task("stale").await;
    assert_eq!(repaired.state, TaskState::Completed);
    assert!(repaired.failed);

    handle.stop().await.unwrap();
}

/// Test: Every elapsed period runs exactly one pass
#[tokio::test(start_paused = true)]
async fn test_each_tick_sweeps() {
    let harness = Harness::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = converger(harness.store.clone())
        .with_events(EventSink::new(tx))
        .spawn();

    tokio::time::sleep(TICK * 3 + TICK / 2).await;
    handle.stop().await.unwrap();

    let passes = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ConvergeEvent::SweepAborted { .. }))
        .count();
    // Empty task subtree: every pass aborts on the listing.
    assert_eq!(passes, 3);
}

/// Test: Failing and panicking siblings are reported and the sweep still lands
#[tokio::test(start_paused = true)]
async fn test_broken_siblings_do_not_block_sweep() {
    let harness = Harness::new();
    harness
        .put_task(&task("stale", TaskState::Pending, 40, 40))
        .await;
    let failing = Arc::new(Sibling {
        fail: true,
        ..Sibling::named("lrps")
    });
    let panicking = Arc::new(Sibling {
        panic: true,
        ..Sibling::named("auctions")
    });
    let healthy = Arc::new(Sibling::named("desired"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let converger = converger(harness.store.clone())
        .with_events(EventSink::new(tx))
        .with_reconciler(failing.clone())
        .with_reconciler(panicking.clone())
        .with_reconciler(healthy.clone());

    converger.tick().await;
    assert!(harness.task("stale").await.failed);

    // Outcomes of the first runs are collected when the next tick starts.
    tokio::time::sleep(TICK).await;
    converger.tick().await;

    for sibling in [&failing, &panicking, &healthy] {
        assert!(sibling.calls.load(Ordering::SeqCst) >= 1);
    }
    let mut failed: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ConvergeEvent::ReconcilerFailed { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    failed.sort();
    assert_eq!(failed, vec!["auctions".to_string(), "lrps".to_string()]);
}

/// Test: A sibling that never returns cannot stall later sweeps or shutdown
#[tokio::test(start_paused = true)]
async fn test_hung_sibling_does_not_stall_loop() {
    let harness = Harness::new();
    let hung = Arc::new(Sibling {
        stall: Some(Duration::from_secs(24 * 60 * 60)),
        ..Sibling::named("hung")
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = converger(harness.store.clone())
        .with_events(EventSink::new(tx))
        .with_reconciler(hung.clone())
        .spawn();

    tokio::time::sleep(TICK * 5 + TICK / 2).await;

    let passes = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ConvergeEvent::SweepAborted { .. }))
        .count();
    assert_eq!(passes, 5);
    // Still running from the first tick, so never started again.
    assert_eq!(hung.calls.load(Ordering::SeqCst), 1);

    let stopping = tokio::time::Instant::now();
    handle.stop().await.unwrap();
    assert!(stopping.elapsed() < TICK);
    assert!(!hung.finished.load(Ordering::SeqCst));
}

/// Test: Stopping aborts a sibling run that would outlive the loop
#[tokio::test(start_paused = true)]
async fn test_stop_aborts_outstanding_sibling() {
    let harness = Harness::new();
    let slow = Arc::new(Sibling {
        stall: Some(Duration::from_secs(5)),
        ..Sibling::named("slow")
    });
    let handle = converger(harness.store.clone())
        .with_reconciler(slow.clone())
        .spawn();

    tokio::time::sleep(TICK + TICK / 2).await;
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

    handle.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!slow.finished.load(Ordering::SeqCst));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
}

/// Test: A slow sibling is not restarted until its previous run is done
#[tokio::test(start_paused = true)]
async fn test_slow_sibling_runs_never_overlap() {
    let harness = Harness::new();
    let slow = Arc::new(Sibling {
        stall: Some(TICK * 3 + TICK / 4),
        ..Sibling::named("slow")
    });
    let handle = converger(harness.store.clone())
        .with_reconciler(slow.clone())
        .spawn();

    // First run spans 1s to 4.25s; ticks at 2s, 3s and 4s skip it.
    tokio::time::sleep(TICK * 4 + TICK / 2).await;
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    assert!(slow.finished.load(Ordering::SeqCst));

    tokio::time::sleep(TICK).await;
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);

    handle.stop().await.unwrap();
}

/// Test: Loop state moves from created to running to stopped
#[tokio::test(start_paused = true)]
async fn test_loop_state_transitions() {
    let converger = Arc::new(converger(Arc::new(MemoryStore::new())));
    assert_eq!(converger.state(), LoopState::Created);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let converger = Arc::clone(&converger);
        let cancel = cancel.clone();
        async move { converger.run(cancel).await }
    });

    tokio::time::sleep(TICK / 2).await;
    assert_eq!(converger.state(), LoopState::Running);

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(converger.state(), LoopState::Stopped);
}

/// Test: Cancelling before the first period means no tick ever runs
#[tokio::test(start_paused = true)]
async fn test_cancel_before_first_tick() {
    let sibling = Arc::new(Sibling::named("never"));
    let handle = converger(Arc::new(MemoryStore::new()))
        .with_reconciler(sibling.clone())
        .spawn();

    tokio::time::sleep(TICK / 2).await;
    handle.stop().await.unwrap();
    tokio::time::sleep(TICK * 5).await;

    assert_eq!(sibling.calls.load(Ordering::SeqCst), 0);
}

/// Test: A stopped converger stays stopped when run again
#[tokio::test(start_paused = true)]
async fn test_stopped_loop_cannot_be_restarted() {
    let sibling = Arc::new(Sibling::named("counted"));
    let converger = converger(Arc::new(MemoryStore::new())).with_reconciler(sibling.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    converger.run(cancel).await;
    assert_eq!(converger.state(), LoopState::Stopped);

    let restart = tokio::spawn({
        let converger = Arc::new(converger);
        let state = Arc::clone(&converger);
        async move {
            converger.run(CancellationToken::new()).await;
            state.state()
        }
    });
    tokio::time::sleep(TICK * 3).await;

    assert!(restart.is_finished());
    assert_eq!(restart.await.unwrap(), LoopState::Stopped);
    assert_eq!(sibling.calls.load(Ordering::SeqCst), 0);
}
