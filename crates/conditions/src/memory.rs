//! In-memory [`EntityStore`] for unit tests.
//!
//! Mirrors the API server's optimistic concurrency: every write bumps the
//! resource version and stale writes fail with [`StoreError::Conflict`].
//! Conflicts can also be injected to exercise retry loops.

use crate::store::{EntityStore, StoreError};
use async_trait::async_trait;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Key = (String, String);

#[derive(Debug)]
struct Inner<K> {
    objects: BTreeMap<Key, K>,
    version: u64,
    writes: usize,
    injected_conflicts: u32,
}

/// Mock resource store.
#[derive(Debug, Clone)]
pub struct MemoryStore<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                writes: 0,
                injected_conflicts: 0,
            })),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> Result<Key, StoreError> {
    let name = obj.meta().name.clone().ok_or(StoreError::MissingName)?;
    Ok((obj.meta().namespace.clone().unwrap_or_default(), name))
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds an object without counting a write. Returns the stored copy.
    pub fn insert(&self, mut obj: K) -> K {
        let mut inner = self.lock();
        inner.version += 1;
        obj.meta_mut().resource_version = Some(inner.version.to_string());
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if let Ok(key) = key_of(&obj) {
            inner.objects.insert(key, obj.clone());
        }
        obj
    }

    /// Current copy of an object, if present.
    pub fn find(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.unwrap_or_default().to_string(), name.to_string()))
            .cloned()
    }

    /// Removes an object.
    pub fn remove(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.lock()
            .objects
            .remove(&(namespace.unwrap_or_default().to_string(), name.to_string()))
    }

    /// Number of successful writes (create, replace, replace_status).
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Makes the next `n` writes fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().injected_conflicts = n;
    }

    fn check_write(inner: &mut Inner<K>, obj: &K, key: &Key) -> Result<K, StoreError> {
        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Err(StoreError::Conflict(format!("injected conflict for {}/{}", key.0, key.1)));
        }
        let stored = inner
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key.0, key.1)))?;
        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(StoreError::Conflict(format!(
                "{}/{} has version {:?}, write carried {:?}",
                key.0,
                key.1,
                stored.meta().resource_version,
                obj.meta().resource_version
            )));
        }
        Ok(stored)
    }

    fn commit(inner: &mut Inner<K>, key: Key, mut obj: K) -> K {
        inner.version += 1;
        inner.writes += 1;
        obj.meta_mut().resource_version = Some(inner.version.to_string());
        inner.objects.insert(key, obj.clone());
        obj
    }
}

#[async_trait]
impl<K> EntityStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError> {
        self.find(namespace, name)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{name}", namespace.unwrap_or_default())))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }
        let mut obj = obj.clone();
        obj.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        Ok(Self::commit(&mut inner, key, obj))
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        Self::check_write(&mut inner, obj, &key)?;
        Ok(Self::commit(&mut inner, key, obj.clone()))
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj)?;
        let mut inner = self.lock();
        let stored = Self::check_write(&mut inner, obj, &key)?;

        let mut merged = serde_json::to_value(&stored)?;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or_default();
        merged["status"] = status;
        let merged: K = serde_json::from_value(merged)?;
        Ok(Self::commit(&mut inner, key, merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{Cluster, ClusterSpec, ClusterStatus, DriverSpec};
    use serde_json::json;

    fn applied(config: serde_json::Value) -> Option<ClusterStatus> {
        Some(ClusterStatus {
            applied_spec: Some(DriverSpec {
                driver_name: "rancherKubernetesEngine".to_string(),
                config,
                nodes: Vec::new(),
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_replace_status_drops_removed_nested_keys() {
        let store = MemoryStore::new();
        let mut c1 = Cluster::new("c1", ClusterSpec::default());
        c1.status = applied(json!({"network": {"plugin": "canal", "mtu": 1450}, "sshAgentAuth": true}));
        let mut c1 = store.insert(c1);

        c1.status = applied(json!({"network": {"plugin": "canal"}}));
        store.replace_status(&c1).await.unwrap();

        let stored = store.find(None, "c1").unwrap();
        let config = stored.status.unwrap().applied_spec.unwrap().config;
        assert_eq!(config, json!({"network": {"plugin": "canal"}}));
    }

    #[tokio::test]
    async fn test_replace_status_leaves_spec_alone() {
        let store = MemoryStore::new();
        let c1 = store.insert(Cluster::new("c1", ClusterSpec::default()));

        let mut write = c1.clone();
        write.spec.display_name = Some("renamed".to_string());
        write.status = applied(json!({}));
        store.replace_status(&write).await.unwrap();

        let stored = store.find(None, "c1").unwrap();
        assert_eq!(stored.spec.display_name, None);
        assert!(stored.status.unwrap().applied_spec.is_some());
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStore::new();
        let c1 = store.insert(Cluster::new("c1", ClusterSpec::default()));
        store.replace_status(&c1).await.unwrap();

        let err = store.replace_status(&c1).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
