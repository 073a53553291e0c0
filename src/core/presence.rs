//! Executor liveness.
//!
//! An executor is alive while its presence record exists. Expiring stale
//! records is the job of the store or the publisher, not of this module.

use std::collections::HashSet;

use crate::store::schema::EXECUTOR_SCHEMA_ROOT;
use crate::store::StoreSnapshot;

/// Answers whether an executor is currently alive.
pub trait Liveness {
    fn is_alive(&self, executor_id: &str) -> bool;
}

/// Executor ids with a presence record in one listing of the executor subtree.
#[derive(Debug, Clone, Default)]
pub struct ExecutorPresence {
    alive: HashSet<String>,
}

impl ExecutorPresence {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Collect the executor ids directly under the executor root.
    pub fn from_snapshot(snapshot: &StoreSnapshot) -> Self {
        let prefix = format!("{}/", EXECUTOR_SCHEMA_ROOT);
        let alive = snapshot
            .iter()
            .filter_map(|node| node.key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        Self { alive }
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }
}

impl Liveness for ExecutorPresence {
    fn is_alive(&self, executor_id: &str) -> bool {
        !executor_id.is_empty() && self.alive.contains(executor_id)
    }
}
