//! Relays driver log events onto a cluster condition and the audit log.

use conditions::{ConditionType, EntityStore, RetryPolicy, StoreError, retry};
use crds::Cluster;
use driver_gateway::{DriverEvent, EventLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer of one driver call's log stream.
pub struct LogRelay {
    clusters: Arc<dyn EntityStore<Cluster>>,
    cluster: String,
    condition: ConditionType,
    attempts: u32,
}

impl LogRelay {
    pub fn new(clusters: Arc<dyn EntityStore<Cluster>>, cluster: impl Into<String>, condition: ConditionType, attempts: u32) -> Self {
        Self {
            clusters,
            cluster: cluster.into(),
            condition,
            attempts,
        }
    }

    /// Runs until the stream closes or `cancel` fires; events already
    /// queued at cancellation are still relayed.
    pub fn spawn(self, events: UnboundedReceiver<DriverEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(self, mut events: UnboundedReceiver<DriverEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.relay(event).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        self.relay(event).await;
                    }
                    break;
                }
            }
        }
        debug!(cluster = %self.cluster, "Driver log relay finished");
    }

    async fn relay(&self, event: DriverEvent) {
        let message = match event.level {
            EventLevel::Info => {
                info!(target: "cluster_audit", cluster = %self.cluster, "{}", event.message);
                event.message
            }
            EventLevel::Warn => {
                warn!(target: "cluster_audit", cluster = %self.cluster, "{}", event.message);
                event.message
            }
            EventLevel::Error => {
                error!(target: "cluster_audit", cluster = %self.cluster, "{}", event.message);
                format!("[Error] {}", event.message)
            }
        };

        let policy = RetryPolicy::new(self.attempts, Duration::ZERO);
        let result = retry(policy, "relay_driver_log", |_| {
            let message = message.clone();
            async move {
                let mut latest = self.clusters.get(None, &self.cluster).await?;
                if self.condition.get_message(&latest) == message {
                    return Ok::<(), StoreError>(());
                }
                self.condition.set_message(&mut latest, message);
                self.clusters.replace_status(&latest).await.map(|_| ())
            }
        })
        .await;

        if let Err(e) = result {
            debug!(cluster = %self.cluster, error = %e, "Dropped driver log event");
        }
    }
}
