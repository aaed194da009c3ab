use super::*;
use crate::dialer::Connector;
use crate::logstream::{DriverEvent, log_stream};
use crate::mock::StaticDialer;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const ENGINE: &str = r#"#!/bin/sh
echo "engine $1"
if [ "$1" = "up" ]; then
  echo '{"apiEndpoint":"https://10.0.0.1:6443","serviceAccountToken":"token","caCert":"Y2E="}' > cluster.state.json
fi
"#;

const FAILING_ENGINE: &str = r#"#!/bin/sh
echo "[network] failed to reach node c1:m1" 1>&2
exit 1
"#;

fn engine(dir: &TempDir, script: &str) -> CommandDriver {
    let path = dir.path().join("engine.sh");
    std::fs::write(&path, script).unwrap();
    CommandDriver::new("sh", dir.path().join("work")).with_args([path.to_string_lossy().into_owned()])
}

fn context(dialer: StaticDialer) -> (DriverContext, UnboundedReceiver<DriverEvent>) {
    let (logger, rx) = log_stream();
    let ctx = DriverContext {
        operation_id: Uuid::new_v4(),
        logger,
        dialer: Arc::new(dialer),
        cancel: CancellationToken::new(),
    };
    (ctx, rx)
}

fn spec() -> DriverSpec {
    DriverSpec {
        driver_name: crds::DRIVER_RKE.to_string(),
        config: serde_json::json!({ "network": { "plugin": "canal" } }),
        nodes: vec![
            NodeConfig {
                node_name: "c1:m1".to_string(),
                address: "10.0.0.5".to_string(),
                user: "root".to_string(),
                port: "22".to_string(),
                role: vec!["etcd".to_string(), "controlplane".to_string()],
                ..Default::default()
            },
            NodeConfig {
                node_name: "c1:m2".to_string(),
                address: "10.0.0.6".to_string(),
                user: "ubuntu".to_string(),
                port: "22".to_string(),
                role: vec!["worker".to_string()],
                ssh_key: "custom-key".to_string(),
                ..Default::default()
            },
        ],
    }
}

#[tokio::test]
async fn test_create_runs_engine_and_reads_state() {
    let tmp = TempDir::new().unwrap();
    let driver = engine(&tmp, ENGINE);
    let dialer = StaticDialer::default().with(
        NodeRef::new("c1", "m1"),
        Connector::Ssh {
            address: "192.168.1.5".to_string(),
            port: "2222".to_string(),
            user: "docker".to_string(),
            private_key: "machine-key".to_string(),
        },
    );
    let (ctx, mut rx) = context(dialer);

    let info = driver.create(&ctx, "c1", &spec()).await.unwrap();
    assert_eq!(info.api_endpoint, "https://10.0.0.1:6443");
    assert_eq!(info.service_account_token, "token");

    let written: Value =
        serde_json::from_slice(&std::fs::read(tmp.path().join("work/cluster-c1/cluster.json")).unwrap()).unwrap();
    assert_eq!(written["clusterName"], "c1");
    assert_eq!(written["network"]["plugin"], "canal");
    assert_eq!(written["nodes"][0]["address"], "192.168.1.5");
    assert_eq!(written["nodes"][0]["sshKey"], "machine-key");
    assert_eq!(written["nodes"][0]["port"], "2222");
    assert_eq!(written["nodes"][1]["sshKey"], "custom-key");
    assert_eq!(written["nodes"][1]["user"], "ubuntu");

    let mut lines = Vec::new();
    while let Ok(event) = rx.try_recv() {
        lines.push(event.message);
    }
    assert!(lines.iter().any(|l| l == "engine up"));
}

#[tokio::test]
async fn test_create_reports_existing_cluster() {
    let tmp = TempDir::new().unwrap();
    let driver = engine(&tmp, ENGINE);
    let (ctx, _rx) = context(StaticDialer::default());

    driver.create(&ctx, "c1", &spec()).await.unwrap();
    let err = driver.create(&ctx, "c1", &spec()).await.unwrap_err();
    assert!(matches!(err, DriverError::AlreadyExists));

    driver.update(&ctx, "c1", &spec()).await.unwrap();
}

#[tokio::test]
async fn test_engine_failure_surfaces_output() {
    let tmp = TempDir::new().unwrap();
    let driver = engine(&tmp, FAILING_ENGINE);
    let (ctx, _rx) = context(StaticDialer::default());

    let err = driver.update(&ctx, "c1", &spec()).await.unwrap_err();
    match err {
        DriverError::Command { message, .. } => assert!(message.contains("failed to reach node c1:m1")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_remove_cleans_working_directory() {
    let tmp = TempDir::new().unwrap();
    let driver = engine(&tmp, ENGINE);
    let (ctx, _rx) = context(StaticDialer::default());

    // Never provisioned: nothing to do.
    driver.remove(&ctx, "c1", &spec()).await.unwrap();

    driver.create(&ctx, "c1", &spec()).await.unwrap();
    driver.remove(&ctx, "c1", &spec()).await.unwrap();
    assert!(!tmp.path().join("work/cluster-c1").exists());
}

#[tokio::test]
async fn test_malformed_node_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let driver = engine(&tmp, ENGINE);
    let (ctx, _rx) = context(StaticDialer::default());
    let mut spec = spec();
    spec.nodes[0].node_name = "m1".to_string();

    let err = driver.update(&ctx, "c1", &spec).await.unwrap_err();
    assert!(matches!(err, DriverError::Reference(_)));
}
