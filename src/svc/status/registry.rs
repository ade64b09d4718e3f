//! # Registry module
//!
//! This module provides the registry of clusters known to the health
//! observer. Entries carry a per-cluster lock so a key is never processed by
//! the reconciliation driver and the observer at the same time

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::{Arc, RwLock},
};

use tokio::sync::Mutex;

// -----------------------------------------------------------------------------
// ClusterKey structure

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl Display for ClusterKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// -----------------------------------------------------------------------------
// Registry structure

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<ClusterKey, Arc<Mutex<()>>>>>,
}

impl Registry {
    /// record the cluster and return its entry lock, keeping the lock of an
    /// already known cluster
    pub fn register(&self, key: ClusterKey) -> Arc<Mutex<()>> {
        let mut inner = self
            .inner
            .write()
            .expect("registry lock to not be poisoned");

        inner
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .to_owned()
    }

    /// forget the cluster, an in-flight observation holding the entry lock
    /// simply completes on its own clone
    pub fn unregister(&self, key: &ClusterKey) {
        let mut inner = self
            .inner
            .write()
            .expect("registry lock to not be poisoned");

        inner.remove(key);
    }

    /// returns the known clusters with their entry locks
    pub fn snapshot(&self) -> Vec<(ClusterKey, Arc<Mutex<()>>)> {
        let inner = self
            .inner
            .read()
            .expect("registry lock to not be poisoned");

        inner
            .iter()
            .map(|(key, lock)| (key.to_owned(), lock.to_owned()))
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_and_snapshots_are_stable() {
        let registry = Registry::default();
        let key = ClusterKey::new("ns1", "demo");

        let first = registry.register(key.to_owned());
        let second = registry.register(key.to_owned());
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(registry.snapshot().len(), 1);

        registry.unregister(&key);
        assert!(registry.snapshot().is_empty());
    }
}
