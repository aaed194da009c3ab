//! In-memory doubles for the gateway seams, used by this crate's tests and
//! by the controllers' tests through the `test-util` feature.

use crate::dialer::{Connector, Dialer};
use crate::driver::{ClusterDriver, ClusterInfo};
use crate::error::{BlobStoreError, DialError, DriverError, ExchangeError, ValidationError};
use crate::exchange::CredentialExchanger;
use crate::logstream::DriverContext;
use crate::store::EncryptedStore;
use crate::validate::ApiValidator;
use async_trait::async_trait;
use crds::{DriverSpec, NodeRef};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Recording [`ClusterDriver`].
#[derive(Debug)]
pub struct MockDriver {
    info: ClusterInfo,
    exists: AtomicBool,
    failures: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    last_spec: Mutex<Option<DriverSpec>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new(ClusterInfo {
            api_endpoint: "https://10.0.0.1:6443".to_string(),
            service_account_token: "token".to_string(),
            ca_cert: "Y2E=".to_string(),
        })
    }
}

impl MockDriver {
    /// Driver answering every successful call with `info`.
    pub fn new(info: ClusterInfo) -> Self {
        Self {
            info,
            exists: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
        }
    }

    /// Makes `create` report that the cluster already exists.
    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::SeqCst);
    }

    /// Fails the next `n` calls of any kind.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fails every following call.
    pub fn fail_always(&self) {
        self.fail_next(usize::MAX);
    }

    /// Credentials returned by successful calls.
    pub fn info(&self) -> ClusterInfo {
        self.info.clone()
    }

    /// Number of `create` calls so far.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls so far.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls so far.
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Spec passed to the most recent call.
    pub fn last_spec(&self) -> Option<DriverSpec> {
        lock(&self.last_spec).clone()
    }

    fn call(&self, verb: &str, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<(), DriverError> {
        *lock(&self.last_spec) = Some(spec.clone());
        ctx.logger.info(format!("{verb} cluster [{name}]"));
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            ctx.logger.error(format!("{verb} of [{name}] failed"));
            return Err(DriverError::Command {
                command: format!("mock {verb}"),
                message: "engine failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterDriver for MockDriver {
    async fn create(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.exists.load(Ordering::SeqCst) {
            return Err(DriverError::AlreadyExists);
        }
        self.call("create", ctx, name, spec)?;
        self.exists.store(true, Ordering::SeqCst);
        Ok(self.info.clone())
    }

    async fn update(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<ClusterInfo, DriverError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.call("update", ctx, name, spec)?;
        Ok(self.info.clone())
    }

    async fn remove(&self, ctx: &DriverContext, name: &str, spec: &DriverSpec) -> Result<(), DriverError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.call("remove", ctx, name, spec)?;
        self.exists.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// [`Dialer`] over a fixed map; unknown nodes are not found.
#[derive(Debug, Default)]
pub struct StaticDialer {
    connectors: HashMap<String, Connector>,
}

impl StaticDialer {
    /// Adds a connector for `node`.
    #[must_use]
    pub fn with(mut self, node: NodeRef, connector: Connector) -> Self {
        self.connectors.insert(node.to_string(), connector);
        self
    }
}

#[async_trait]
impl Dialer for StaticDialer {
    async fn resolve(&self, node: &NodeRef) -> Result<Connector, DialError> {
        self.connectors
            .get(&node.to_string())
            .cloned()
            .ok_or_else(|| DialError::NotFound(node.to_string()))
    }
}

/// [`EncryptedStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryEncryptedStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    reject_puts: AtomicBool,
}

impl MemoryEncryptedStore {
    /// Stored blob, if any.
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.blobs).get(key).cloned()
    }

    /// Whether `key` holds a blob.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.blobs).contains_key(key)
    }

    /// Number of `put` calls so far.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Makes every following `put` fail.
    pub fn reject_puts(&self, reject: bool) {
        self.reject_puts.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl EncryptedStore for MemoryEncryptedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), BlobStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.reject_puts.load(Ordering::SeqCst) {
            return Err(BlobStoreError::InvalidKey(key.to_string()));
        }
        lock(&self.blobs).insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        lock(&self.blobs).remove(key);
        Ok(())
    }
}

/// [`ApiValidator`] with a canned answer.
#[derive(Debug, Default)]
pub struct StaticValidator {
    failure_status: Option<u16>,
    calls: AtomicUsize,
}

impl StaticValidator {
    /// Rejects every endpoint with the given HTTP status.
    pub fn failing(status: u16) -> Self {
        Self {
            failure_status: Some(status),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApiValidator for StaticValidator {
    async fn validate(&self, endpoint: &str, _token: &str, _ca_cert: &str) -> Result<(), ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if endpoint.is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }
        match self.failure_status {
            Some(status) => Err(ValidationError::Status {
                endpoint: endpoint.to_string(),
                status,
            }),
            None => Ok(()),
        }
    }
}

/// [`CredentialExchanger`] returning fixed credentials.
#[derive(Debug)]
pub struct StaticExchanger {
    info: Option<ClusterInfo>,
    calls: AtomicUsize,
}

impl StaticExchanger {
    pub fn new(info: ClusterInfo) -> Self {
        Self {
            info: Some(info),
            calls: AtomicUsize::new(0),
        }
    }

    /// Never manages to obtain a token.
    pub fn failing() -> Self {
        Self {
            info: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchanger for StaticExchanger {
    async fn exchange(&self, _kubeconfig: &str) -> Result<ClusterInfo, ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.info
            .clone()
            .ok_or_else(|| ExchangeError::TokenTimeout("kube-system/clusterforge-admin".to_string()))
    }
}
