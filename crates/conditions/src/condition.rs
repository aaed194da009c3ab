//! Named condition types and the guarded step runners.

use crate::error::StepError;
use crate::retry::{RetryPolicy, retry_if};
use crate::store::{EntityStore, StoreError};
use chrono::Utc;
use crds::{Condition, ConditionStatus, Conditioned};
use kube::Resource;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of running a step: the latest object plus the step's verdict.
///
/// The object is returned on both paths so that partial progress made by a
/// failing step is never lost.
#[derive(Debug)]
pub struct StepOutcome<K, E> {
    /// Latest version of the resource
    pub object: K,
    /// Step verdict
    pub result: Result<(), E>,
}

impl<K, E> StepOutcome<K, E> {
    /// Successful outcome.
    pub fn ok(object: K) -> Self {
        Self { object, result: Ok(()) }
    }

    /// Failed outcome that still carries the object.
    pub fn err(object: K, error: impl Into<E>) -> Self {
        Self {
            object,
            result: Err(error.into()),
        }
    }

    /// Splits into the object and a plain `Result`.
    pub fn into_result(self) -> Result<K, E> {
        self.result.map(|()| self.object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    /// Skip once the condition is True
    UntilTrue,
    /// Always run
    Always,
}

/// A named condition, e.g. `Provisioned`.
#[derive(Debug, Clone, Copy)]
pub struct ConditionType {
    name: &'static str,
    persist: RetryPolicy,
}

impl ConditionType {
    /// Declares a condition type.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            persist: RetryPolicy::new(5, Duration::from_millis(100)),
        }
    }

    /// Overrides how often a conflicting status write is rebased and retried.
    #[must_use]
    pub const fn with_persist_policy(mut self, policy: RetryPolicy) -> Self {
        self.persist = policy;
        self
    }

    /// Condition name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current status, if the condition exists.
    pub fn get_status<K: Conditioned>(&self, obj: &K) -> Option<ConditionStatus> {
        obj.condition(self.name).map(|c| c.status)
    }

    /// Current message, empty if unset.
    pub fn get_message<'a, K: Conditioned>(&self, obj: &'a K) -> &'a str {
        obj.condition(self.name).map_or("", |c| c.message.as_str())
    }

    /// Whether the condition is present and True.
    pub fn is_true<K: Conditioned>(&self, obj: &K) -> bool {
        self.get_status(obj) == Some(ConditionStatus::True)
    }

    /// Whether the condition is present and False.
    pub fn is_false<K: Conditioned>(&self, obj: &K) -> bool {
        self.get_status(obj) == Some(ConditionStatus::False)
    }

    /// Unknown or absent.
    pub fn is_unknown<K: Conditioned>(&self, obj: &K) -> bool {
        matches!(self.get_status(obj), None | Some(ConditionStatus::Unknown))
    }

    /// Adds the condition as Unknown unless it already exists.
    pub fn create_unknown_if_not_exists<K: Conditioned>(&self, obj: &mut K) {
        if obj.condition(self.name).is_none() {
            obj.conditions_mut().push(Condition::unknown(self.name));
        }
    }

    /// Marks True and clears reason and message.
    pub fn set_true<K: Conditioned>(&self, obj: &mut K) {
        self.set(obj, ConditionStatus::True, String::new(), String::new());
    }

    /// Marks False with a reason and message.
    pub fn set_false<K: Conditioned>(&self, obj: &mut K, reason: impl Into<String>, message: impl Into<String>) {
        self.set(obj, ConditionStatus::False, reason.into(), message.into());
    }

    /// Marks Unknown with a reason and message.
    pub fn set_unknown<K: Conditioned>(&self, obj: &mut K, reason: impl Into<String>, message: impl Into<String>) {
        self.set(obj, ConditionStatus::Unknown, reason.into(), message.into());
    }

    /// Replaces the message, keeping status and reason.
    pub fn set_message<K: Conditioned>(&self, obj: &mut K, message: impl Into<String>) {
        let message = message.into();
        self.create_unknown_if_not_exists(obj);
        if let Some(c) = find_mut(obj, self.name) {
            if c.message != message {
                c.message = message;
                c.last_update_time = Some(Utc::now());
            }
        }
    }

    fn set<K: Conditioned>(&self, obj: &mut K, status: ConditionStatus, reason: String, message: String) {
        self.create_unknown_if_not_exists(obj);
        let Some(c) = find_mut(obj, self.name) else {
            return;
        };
        if c.status == status && c.reason == reason && c.message == message {
            return;
        }
        let now = Utc::now();
        if c.status != status {
            c.last_transition_time = Some(now);
        }
        c.status = status;
        c.reason = reason;
        c.message = message;
        c.last_update_time = Some(now);
    }

    /// Runs `step` unless the condition is already True.
    ///
    /// Success marks the condition True, failure marks it False, and
    /// a not-ready error leaves it Unknown. The resource is persisted
    /// whenever its status changed.
    pub async fn once<K, E, F, Fut>(&self, store: &dyn EntityStore<K>, obj: K, step: F) -> StepOutcome<K, E>
    where
        K: Resource + Conditioned + Clone + Serialize + Send + Sync,
        E: StepError + From<StoreError>,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = StepOutcome<K, E>>,
    {
        self.run(Guard::UntilTrue, store, obj, step).await
    }

    /// Runs `step` on every call and records its outcome.
    pub async fn do_<K, E, F, Fut>(&self, store: &dyn EntityStore<K>, obj: K, step: F) -> StepOutcome<K, E>
    where
        K: Resource + Conditioned + Clone + Serialize + Send + Sync,
        E: StepError + From<StoreError>,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = StepOutcome<K, E>>,
    {
        self.run(Guard::Always, store, obj, step).await
    }

    /// Runs `step` until it has succeeded once, for steps that are expected
    /// to wait on other resources.
    ///
    /// The condition is created as Unknown before the first attempt so a
    /// waiting resource always shows why it is waiting.
    pub async fn do_until_true<K, E, F, Fut>(
        &self,
        store: &dyn EntityStore<K>,
        mut obj: K,
        step: F,
    ) -> StepOutcome<K, E>
    where
        K: Resource + Conditioned + Clone + Serialize + Send + Sync,
        E: StepError + From<StoreError>,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = StepOutcome<K, E>>,
    {
        if self.is_true(&obj) {
            return StepOutcome::ok(obj);
        }
        self.create_unknown_if_not_exists(&mut obj);
        self.run(Guard::UntilTrue, store, obj, step).await
    }

    async fn run<K, E, F, Fut>(&self, guard: Guard, store: &dyn EntityStore<K>, obj: K, step: F) -> StepOutcome<K, E>
    where
        K: Resource + Conditioned + Clone + Serialize + Send + Sync,
        E: StepError + From<StoreError>,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = StepOutcome<K, E>>,
    {
        if guard == Guard::UntilTrue && self.is_true(&obj) {
            debug!(condition = self.name, "Condition already true, skipping step");
            return StepOutcome::ok(obj);
        }

        let baseline = status_snapshot(&obj);
        let baseline_version = obj.meta().resource_version.clone();

        let StepOutcome { mut object, result } = step(obj).await;

        match &result {
            Ok(()) => self.set_true(&mut object),
            Err(e) if e.is_not_ready() => {
                debug!(condition = self.name, reason = %e, "Step not ready");
                self.set_unknown(&mut object, e.reason(), e.to_string());
            }
            Err(e) => {
                warn!(condition = self.name, error = %e, "Step failed");
                self.set_false(&mut object, e.reason(), e.to_string());
            }
        }

        // A step that wrote the resource itself moved the version on; the
        // status still has to be written when it differs from the baseline.
        let unchanged = status_snapshot(&object) == baseline && object.meta().resource_version == baseline_version;
        if unchanged {
            return StepOutcome { object, result };
        }

        match persist_status(store, object.clone(), self.persist).await {
            Ok(saved) => StepOutcome { object: saved, result },
            Err(e) => {
                warn!(condition = self.name, error = %e, "Failed to persist condition");
                let result = match result {
                    Ok(()) => Err(E::from(e)),
                    Err(step_err) => Err(step_err),
                };
                StepOutcome { object, result }
            }
        }
    }
}

fn find_mut<'a, K: Conditioned>(obj: &'a mut K, name: &str) -> Option<&'a mut Condition> {
    obj.conditions_mut().iter_mut().find(|c| c.type_ == name)
}

fn status_snapshot<K: Serialize>(obj: &K) -> Option<serde_json::Value> {
    serde_json::to_value(obj).ok().and_then(|v| v.get("status").cloned())
}

/// Writes the status of `obj`, rebasing onto the latest resource version on
/// conflict.
///
/// Status is owned by a single controller, so the local status wins over
/// whatever version is current on the server.
pub async fn persist_status<K>(store: &dyn EntityStore<K>, obj: K, policy: RetryPolicy) -> Result<K, StoreError>
where
    K: Resource + Clone + Send + Sync,
{
    let namespace = obj.meta().namespace.clone();
    let name = obj.meta().name.clone().ok_or(StoreError::MissingName)?;
    let pending = std::sync::Mutex::new(obj);

    retry_if(policy, "persist_status", StoreError::is_conflict, |attempt| {
        let namespace = namespace.clone();
        let name = name.clone();
        let pending = &pending;
        async move {
            if attempt > 1 {
                let latest = store.get(namespace.as_deref(), &name).await?;
                let mut guard = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.meta_mut().resource_version = latest.meta().resource_version.clone();
            }
            let current = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            store.replace_status(&current).await
        }
    })
    .await
}

#[cfg(test)]
#[path = "condition_test.rs"]
mod condition_test;
