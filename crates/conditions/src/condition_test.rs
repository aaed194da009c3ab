//! Unit tests for the condition step runners

use super::*;
use crate::memory::MemoryStore;
use crds::{Cluster, ClusterSpec, ClusterStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

const PROVISIONED: ConditionType = ConditionType::new("Provisioned");

#[derive(Debug, Error)]
enum TestError {
    #[error("waiting for nodes")]
    NotReady,
    #[error("driver exploded")]
    Failed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StepError for TestError {
    fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }
}

fn cluster(name: &str) -> Cluster {
    Cluster::new(name, ClusterSpec::default())
}

fn seeded(store: &MemoryStore<Cluster>, name: &str) -> Cluster {
    store.insert(cluster(name))
}

#[tokio::test]
async fn test_once_skips_when_already_true() {
    let store = MemoryStore::new();
    let mut c = cluster("c1");
    PROVISIONED.set_true(&mut c);
    let c = store.insert(c);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .once(&store, c.clone(), |obj| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            StepOutcome::ok(obj)
        })
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.writes(), 0);
    assert_eq!(outcome.object.metadata.resource_version, c.metadata.resource_version);
}

#[tokio::test]
async fn test_once_success_marks_true_and_persists() {
    let store = MemoryStore::new();
    let c = seeded(&store, "c1");

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .once(&store, c, |mut obj: Cluster| async move {
            obj.status.get_or_insert_with(ClusterStatus::default).driver = Some("rancherKubernetesEngine".to_string());
            StepOutcome::ok(obj)
        })
        .await;

    assert!(outcome.result.is_ok());
    assert!(PROVISIONED.is_true(&outcome.object));
    assert_eq!(store.writes(), 1);

    let stored = store.find(None, "c1").unwrap();
    assert!(PROVISIONED.is_true(&stored));
    assert_eq!(stored.status.unwrap().driver.as_deref(), Some("rancherKubernetesEngine"));
}

#[tokio::test]
async fn test_failure_marks_false_and_keeps_partial_progress() {
    let store = MemoryStore::new();
    let c = seeded(&store, "c1");

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .once(&store, c, |mut obj: Cluster| async move {
            obj.status.get_or_insert_with(ClusterStatus::default).api_endpoint = Some("https://10.0.0.1:6443".to_string());
            StepOutcome::err(obj, TestError::Failed)
        })
        .await;

    assert!(matches!(outcome.result, Err(TestError::Failed)));
    assert!(PROVISIONED.is_false(&outcome.object));
    assert_eq!(PROVISIONED.get_message(&outcome.object), "driver exploded");

    let stored = store.find(None, "c1").unwrap();
    assert!(PROVISIONED.is_false(&stored));
    assert_eq!(stored.status.unwrap().api_endpoint.as_deref(), Some("https://10.0.0.1:6443"));
}

#[tokio::test]
async fn test_not_ready_is_not_recorded_as_failure() {
    let store = MemoryStore::new();
    let mut c = cluster("c1");
    PROVISIONED.set_false(&mut c, "Error", "old failure");
    let c = store.insert(c);

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .do_until_true(&store, c, |obj| async move { StepOutcome::err(obj, TestError::NotReady) })
        .await;

    let err = outcome.result.unwrap_err();
    assert!(err.is_not_ready());
    assert_eq!(PROVISIONED.get_status(&outcome.object), Some(ConditionStatus::Unknown));
    assert_eq!(PROVISIONED.get_message(&outcome.object), "waiting for nodes");
    assert!(PROVISIONED.is_unknown(&store.find(None, "c1").unwrap()));
}

#[tokio::test]
async fn test_do_until_true_creates_condition_before_running() {
    let store = MemoryStore::new();
    let c = seeded(&store, "c1");

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .do_until_true(&store, c, |obj: Cluster| async move {
            let seen = PROVISIONED.get_status(&obj);
            assert_eq!(seen, Some(ConditionStatus::Unknown));
            StepOutcome::ok(obj)
        })
        .await;

    assert!(outcome.result.is_ok());
    assert!(PROVISIONED.is_true(&outcome.object));
}

#[tokio::test]
async fn test_do_runs_even_when_true() {
    let store = MemoryStore::new();
    let mut c = cluster("c1");
    PROVISIONED.set_true(&mut c);
    let c = store.insert(c);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .do_(&store, c, |obj| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            StepOutcome::ok(obj)
        })
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Nothing changed, so nothing was written.
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn test_persist_rebases_on_conflict() {
    let store = MemoryStore::new();
    let c = seeded(&store, "c1");
    store.inject_conflicts(2);

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .once(&store, c, |obj| async move { StepOutcome::ok(obj) })
        .await;

    assert!(outcome.result.is_ok());
    assert_eq!(store.writes(), 1);
    assert!(PROVISIONED.is_true(&store.find(None, "c1").unwrap()));
}

#[tokio::test]
async fn test_persist_exhaustion_surfaces_store_error() {
    let store = MemoryStore::new();
    let c = seeded(&store, "c1");
    store.inject_conflicts(10);

    let outcome: StepOutcome<_, TestError> = PROVISIONED
        .with_persist_policy(RetryPolicy::new(3, Duration::ZERO))
        .once(&store, c, |obj| async move { StepOutcome::ok(obj) })
        .await;

    assert!(matches!(outcome.result, Err(TestError::Store(StoreError::Conflict(_)))));
    assert_eq!(store.writes(), 0);
}

#[test]
fn test_transition_time_only_moves_on_status_change() {
    let mut c = cluster("c1");
    PROVISIONED.set_unknown(&mut c, "Waiting", "first");
    let first = c.condition("Provisioned").unwrap().last_transition_time;

    PROVISIONED.set_unknown(&mut c, "Waiting", "second");
    assert_eq!(c.condition("Provisioned").unwrap().last_transition_time, first);
    assert_eq!(PROVISIONED.get_message(&c), "second");

    PROVISIONED.set_true(&mut c);
    let cond = c.condition("Provisioned").unwrap();
    assert!(cond.last_transition_time >= first);
    assert!(cond.message.is_empty());
}
