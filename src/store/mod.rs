//! Versioned key-value store seam.
//!
//! The converger only needs four primitives from the shared store:
//! recursive listing of a subtree, compare-and-swap keyed by a version
//! index, batch deletion, and (for seeding and inspection) plain writes.
//! Every stored value carries the store-wide modification index at which it
//! was last written; [`VersionedStore::compare_and_swap_by_version`] succeeds
//! only when that index still matches.

pub mod memory;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors returned by store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Nothing exists at or under the key.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// A compare-and-swap lost against another writer.
    #[error("version mismatch on key {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }

    /// A lost optimistic write: the record moved on or disappeared.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionMismatch { .. } | StoreError::KeyNotFound { .. }
        )
    }
}

/// A single stored value and the index it was last modified at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// Point-in-time listing of a subtree, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    nodes: Vec<StoreNode>,
}

impl StoreSnapshot {
    pub fn new(mut nodes: Vec<StoreNode>) -> Self {
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Self { nodes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoreNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Hierarchical store with optimistic concurrency.
///
/// Implementations must be `Send + Sync`; the write barrier issues
/// compare-and-swap calls from concurrently spawned tasks.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Lists every value at or below `prefix`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::KeyNotFound`] if nothing exists under `prefix`.
    /// - [`StoreError::Unavailable`] on connectivity failures.
    async fn list_recursively(&self, prefix: &str) -> Result<StoreSnapshot, StoreError>;

    /// Replaces the value at `key` if its version is still `version`.
    ///
    /// Returns the new version on success.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionMismatch`] if another write landed first.
    /// - [`StoreError::KeyNotFound`] if the key was deleted meanwhile.
    /// - [`StoreError::Unavailable`] on connectivity failures.
    async fn compare_and_swap_by_version(
        &self,
        version: u64,
        key: &str,
        value: Vec<u8>,
    ) -> Result<u64, StoreError>;

    /// Deletes all `keys` unconditionally. Missing keys are ignored.
    async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError>;
}
