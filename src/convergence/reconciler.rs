//! Sibling reconcilers run on the converger's cadence.
//!
//! Other resource kinds (long-running process instances, placement
//! auctions) converge on the same tick as tasks. The converger only invokes
//! them; what they repair is their own business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// A reconciliation routine invoked once per converger tick.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run one reconciliation pass as of `now`.
    async fn reconcile(&self, now: DateTime<Utc>) -> Result<()>;
}
