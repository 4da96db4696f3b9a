//! Heartbeat-based liveness monitor.
//!
//! Storage nodes report heartbeats through
//! [`NodeRegistry::record_heartbeat`]. The monitor runs a background loop
//! that marks nodes unreachable once their last heartbeat is older than
//! [`LivenessConfig::heartbeat_timeout_ms`].

use std::sync::Arc;
use std::time::Duration;

use reef_types::{LivenessConfig, unix_millis};
use tracing::{debug, info};

use crate::registry::NodeRegistry;

/// Periodically expires nodes whose heartbeats stopped.
struct LivenessMonitor {
    config: LivenessConfig,
    registry: Arc<NodeRegistry>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl LivenessMonitor {
    /// Run the check loop until shutdown.
    async fn run(&self) {
        info!(
            timeout_ms = self.config.heartbeat_timeout_ms,
            "liveness monitor started"
        );

        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_timeouts();
                }
                _ = shutdown_rx.changed() => {
                    info!("liveness monitor shutting down");
                    break;
                }
            }
        }

        info!("liveness monitor stopped");
    }

    fn check_timeouts(&self) {
        let expired = self
            .registry
            .expire_stale(unix_millis(), self.config.heartbeat_timeout_ms);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired silent nodes");
        }
    }
}

/// Handle to a running liveness monitor.
pub struct LivenessHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl LivenessHandle {
    /// Stop the monitor loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the liveness monitor and return a handle.
pub fn start(config: LivenessConfig, registry: Arc<NodeRegistry>) -> LivenessHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let monitor = LivenessMonitor {
        config,
        registry,
        shutdown_rx,
    };

    let task = tokio::spawn(async move {
        monitor.run().await;
    });

    LivenessHandle { shutdown_tx, task }
}
