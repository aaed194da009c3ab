//! Resource persistence behind the condition engine and the controllers.
//!
//! [`EntityStore`] is the read/modify/write surface the controllers need
//! from the API server. [`KubeStore`] implements it with `kube::Api`; the
//! in-memory [`crate::MemoryStore`] backs the unit tests.

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while reading or writing resources
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency check failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Resource has no name
    #[error("resource has no name")]
    MissingName,

    /// Any other Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Resource could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the write lost an optimistic-concurrency race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the resource is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => Self::AlreadyExists(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message),
            other => Self::Kube(other),
        }
    }
}

/// Read/write access to one resource kind.
///
/// `namespace` is ignored for cluster-scoped kinds. `replace` and
/// `replace_status` carry the object's resource version and fail with
/// [`StoreError::Conflict`] when it is stale. Both replace their part of the
/// object wholesale; nothing is merged with the stored copy.
#[async_trait]
pub trait EntityStore<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Reads one resource.
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError>;

    /// Lists resources, across all namespaces when `namespace` is `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    /// Creates a resource.
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces a resource (spec and metadata).
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces the status subresource.
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;
}

type ApiFactory<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// [`EntityStore`] backed by the Kubernetes API.
pub struct KubeStore<K> {
    api: ApiFactory<K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self { api: Arc::clone(&self.api) }
    }
}

impl<K> Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").field("kind", &std::any::type_name::<K>()).finish()
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()> + 'static,
{
    /// Store for a cluster-scoped kind.
    #[must_use]
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Arc::new(move |_| Api::all(client.clone())),
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + 'static,
{
    /// Store for a namespaced kind.
    #[must_use]
    pub fn namespaced(client: Client) -> Self {
        Self {
            api: Arc::new(move |namespace| match namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            }),
        }
    }
}

fn name_of<K: Resource>(obj: &K) -> Result<String, StoreError> {
    obj.meta().name.clone().ok_or(StoreError::MissingName)
}

#[async_trait]
impl<K> EntityStore<K> for KubeStore<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError> {
        Ok((self.api)(namespace).get(name).await?)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        Ok((self.api)(namespace).list(&ListParams::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let api = (self.api)(obj.meta().namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> {
        let name = name_of(obj)?;
        let api = (self.api)(obj.meta().namespace.as_deref());
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let name = name_of(obj)?;
        let api = (self.api)(obj.meta().namespace.as_deref());
        // PUT of the whole status; the carried resourceVersion makes a stale
        // write fail with 409.
        let body = serde_json::to_vec(obj)?;
        Ok(api.replace_status(&name, &PostParams::default(), body).await?)
    }
}
