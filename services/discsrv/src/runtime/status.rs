//! Periodic status reporting

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::core::orchestrator::DiscoveryOrchestrator;

/// Log `GetStatusReport` every `interval` until `cancel` fires
pub fn start_status_reporter(
    orchestrator: Arc<DiscoveryOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    info!("Status: {}", orchestrator.status_report());
                },
            }
        }
        debug!("Status reporter stopped");
    }
    .in_current_span())
}
