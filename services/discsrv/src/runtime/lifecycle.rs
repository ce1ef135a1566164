//! Runtime lifecycle management
//!
//! Builds the pipeline from configuration, runs one discovery session and,
//! when monitoring starts, keeps the service alive until shutdown.

use std::sync::Arc;

use errors::{PlcError, PlcResult};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::status::start_status_reporter;
use crate::core::catalog::StaticCatalog;
use crate::core::channel::ProtocolChannel;
use crate::core::config::AppConfig;
use crate::core::continuity::ErrorContinuityPolicy;
use crate::core::events::{EventSink, TracingEventSink};
use crate::core::orchestrator::{DiscoveryOrchestrator, OrchestratorSettings, StatusReport};

/// Wire catalog, continuity policy and event sink around `channel`
pub fn build_orchestrator(
    config: &AppConfig,
    channel: Arc<dyn ProtocolChannel>,
    sink: Arc<dyn EventSink>,
) -> DiscoveryOrchestrator {
    let continuity = Arc::new(ErrorContinuityPolicy::new(
        config.continuity.settings(),
        Arc::clone(&sink),
    ));
    DiscoveryOrchestrator::new(
        OrchestratorSettings::from_config(config),
        channel,
        Arc::new(StaticCatalog::new(config.discovery.mode)),
        continuity,
        sink,
    )
}

/// Run the service
///
/// With `once` the monitor is stopped right after discovery. Otherwise the
/// call returns when `shutdown` fires, after monitoring has been stopped.
/// Returns the final status report.
pub async fn run_service(
    config: &AppConfig,
    channel: Arc<dyn ProtocolChannel>,
    once: bool,
    shutdown: CancellationToken,
) -> PlcResult<StatusReport> {
    let orchestrator = Arc::new(build_orchestrator(
        config,
        channel,
        Arc::new(TracingEventSink),
    ));

    let run = match orchestrator.start_discovery(&shutdown).await {
        Ok(run) => run,
        Err(PlcError::Cancelled) => {
            info!("Shutdown requested during discovery");
            return Ok(orchestrator.status_report());
        },
        Err(e) => return Err(e),
    };

    if !run.success {
        warn!(
            "Discovery failed: {}",
            run.error_message.as_deref().unwrap_or("unknown error")
        );
    } else if let Some(discovery) = &run.discovery {
        let stats = discovery.overall_statistics();
        info!(
            "Discovered {} live device(s) ({} active point(s)) on {} in {}ms ({} batch(es), {:.1}% ok)",
            run.live_devices.len(),
            discovery.total_active_devices(),
            discovery.target,
            discovery.total_duration.as_millis(),
            stats.total_batches(),
            stats.success_rate()
        );
        if let Some(reason) = &discovery.fallback_reason {
            warn!("Identification fallback used: {}", reason);
        }
    }

    if run.monitoring_started && !once {
        let reporter_cancel = shutdown.child_token();
        let reporter = start_status_reporter(
            Arc::clone(&orchestrator),
            config.monitoring.status_report_interval(),
            reporter_cancel.clone(),
        );

        shutdown.cancelled().await;
        info!("Shutting down");
        reporter_cancel.cancel();
        if let Err(e) = reporter.await {
            warn!("Status reporter ended abnormally: {}", e);
        }
    }

    orchestrator.stop_monitoring().await;

    let summary = orchestrator.continuity().summary();
    if summary.total_errors > 0 {
        info!(
            "Faults: {} of {} operations ({:.1}%), {} continued",
            summary.total_errors,
            summary.total_operations,
            summary.error_rate,
            summary.continued_operations
        );
        for fault in &summary.top_errors {
            info!("  {} x{}: {}", fault.key, fault.count, fault.last_message);
        }
    }

    Ok(orchestrator.status_report())
}
