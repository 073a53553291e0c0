//! Task convergence: the sweep, the write barrier and the loop that drives them.
//!
//! A [`Converger`] ticks on a fixed period. Each tick runs a
//! [`ConvergenceSweep`] over the task subtree plus any sibling
//! [`Reconciler`]s. The sweep turns what it finds into corrections, and the
//! [`WriteBarrier`] writes those back concurrently under compare-and-swap.

pub mod barrier;
pub mod converger;
pub mod events;
pub mod reconciler;
pub mod sweep;

pub use barrier::{BarrierReport, WriteBarrier};
pub use converger::{Converger, ConvergerConfig, ConvergerHandle, LoopState};
pub use events::{ConvergeEvent, EventSink, SweepReport};
pub use reconciler::Reconciler;
pub use sweep::{decide, plan_sweep, ConvergenceSweep, Correction, SweepPlan, TaskAction};
