//! Background health loop over connected tool servers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::ConnectionManager;

/// Handle to the running health loop; `stop` ends it.
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start probing every `interval`. The first round runs one interval after start.
    pub fn spawn(manager: Arc<ConnectionManager>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tracing::info!("[HealthMonitor] Started (every {}s)", interval.as_secs_f64());
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.run_health_checks().await,
                }
            }
            tracing::info!("[HealthMonitor] Stopped");
        });
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("[HealthMonitor] Loop ended abnormally: {}", e);
        }
    }
}
