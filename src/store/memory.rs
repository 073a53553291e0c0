//! In-memory [`VersionedStore`] with an etcd-style modification index.
//!
//! Every successful write (plain set or compare-and-swap) takes the next
//! value of a single store-wide counter as the record's version, so a
//! version observed in one listing can never be reused by a later write.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, StoreNode, StoreSnapshot, VersionedStore};

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<String, (Vec<u8>, u64)>,
    index: u64,
}

impl MemoryState {
    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }
}

/// Thread-safe in-memory store used by tests and the standalone binary.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `value` at `key` unconditionally and returns its new version.
    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.state.write().await;
        let version = state.next_index();
        state.nodes.insert(key.to_string(), (value.into(), version));
        version
    }

    pub async fn get(&self, key: &str) -> Result<StoreNode, StoreError> {
        let state = self.state.read().await;
        state
            .nodes
            .get(key)
            .map(|(value, version)| StoreNode {
                key: key.to_string(),
                value: value.clone(),
                version: *version,
            })
            .ok_or_else(|| StoreError::KeyNotFound {
                key: key.to_string(),
            })
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.read().await.nodes.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.nodes.is_empty()
    }

    /// All keys with their values rendered as (lossy) UTF-8.
    pub async fn dump(&self) -> BTreeMap<String, String> {
        self.state
            .read()
            .await
            .nodes
            .iter()
            .map(|(key, (value, _))| (key.clone(), String::from_utf8_lossy(value).into_owned()))
            .collect()
    }

    /// Writes every entry of a [`dump`](Self::dump)-shaped map.
    pub async fn load(&self, entries: BTreeMap<String, String>) {
        let mut state = self.state.write().await;
        for (key, value) in entries {
            let version = state.next_index();
            state.nodes.insert(key, (value.into_bytes(), version));
        }
    }
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn list_recursively(&self, prefix: &str) -> Result<StoreSnapshot, StoreError> {
        let prefix = prefix.trim_end_matches('/');
        let state = self.state.read().await;
        let nodes: Vec<StoreNode> = state
            .nodes
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| under_prefix(key, prefix))
            .map(|(key, (value, version))| StoreNode {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect();

        if nodes.is_empty() {
            return Err(StoreError::KeyNotFound {
                key: prefix.to_string(),
            });
        }
        Ok(StoreSnapshot::new(nodes))
    }

    async fn compare_and_swap_by_version(
        &self,
        version: u64,
        key: &str,
        value: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let current = match state.nodes.get(key) {
            Some((_, current)) => *current,
            None => {
                return Err(StoreError::KeyNotFound {
                    key: key.to_string(),
                })
            }
        };
        if current != version {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                actual: current,
            });
        }
        let next = state.next_index();
        state.nodes.insert(key.to_string(), (value, next));
        Ok(next)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for key in keys {
            state.nodes.remove(key);
        }
        Ok(())
    }
}
