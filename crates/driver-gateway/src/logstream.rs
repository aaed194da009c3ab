//! Per-call log stream and call context for driver operations.

use crate::dialer::Dialer;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Severity of a driver event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// A single progress or error line emitted by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverEvent {
    /// Severity
    pub level: EventLevel,
    /// Line as emitted by the driver
    pub message: String,
}

/// Sending half of a driver log stream.
///
/// Sends never block; events sent after the consumer is gone are dropped.
#[derive(Debug, Clone)]
pub struct DriverLogger {
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl DriverLogger {
    /// Sends a progress line.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(EventLevel::Info, message);
    }

    /// Sends a warning line.
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(EventLevel::Warn, message);
    }

    /// Sends an error line.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(EventLevel::Error, message);
    }

    fn emit(&self, level: EventLevel, message: impl Into<String>) {
        let _ = self.tx.send(DriverEvent {
            level,
            message: message.into(),
        });
    }
}

/// Creates a log stream: the logger goes to the driver, the receiver to
/// whoever relays the events.
#[must_use]
pub fn log_stream() -> (DriverLogger, mpsc::UnboundedReceiver<DriverEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DriverLogger { tx }, rx)
}

/// Everything a driver gets for one call.
#[derive(Clone)]
pub struct DriverContext {
    /// Correlates log lines of one call
    pub operation_id: Uuid,
    /// Progress sink
    pub logger: DriverLogger,
    /// Node connector resolution
    pub dialer: Arc<dyn Dialer>,
    /// Fires when the caller abandons the call
    pub cancel: CancellationToken,
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("operation_id", &self.operation_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order_and_stream_closes() {
        let (logger, mut rx) = log_stream();
        logger.info("building etcd plane");
        logger.error("host unreachable");
        drop(logger);

        assert_eq!(rx.recv().await.unwrap().message, "building etcd plane");
        assert_eq!(rx.recv().await.unwrap().level, EventLevel::Error);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_send_after_consumer_gone_is_ignored() {
        let (logger, rx) = log_stream();
        drop(rx);
        logger.warn("nobody listening");
    }
}
