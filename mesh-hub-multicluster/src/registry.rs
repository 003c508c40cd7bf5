use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::controller::ClusterHandler;
use crate::manager::AsyncManager;
use crate::{Error, Result};

/// Concurrent name -> value map. Reads are shared, writes exclusive per
/// shard, and inserting an existing name fails rather than replacing it.
///
/// Iteration order is unspecified.
pub struct Registry<V: Clone> {
    kind: &'static str,
    entries: DashMap<String, V>,
}

/// Running per-cluster managers by cluster name
pub type ManagerMap = Registry<Arc<AsyncManager>>;

/// Lifecycle subscribers by handler name
pub type HandlerMap = Registry<Arc<dyn ClusterHandler>>;

impl<V: Clone> Registry<V> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, name: &str, value: V) -> Result<()> {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered {
                kind: self.kind,
                name: name.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<V> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Result<V> {
        self.entries
            .remove(name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::NotRegistered {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Copy of the current entries. Callers iterate the copy so no shard
    /// lock is held while they await.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
