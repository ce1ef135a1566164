//! Discovery orchestrator
//!
//! Drives one discovery session through six stages:
//!
//! 1. validate the target connection parameters
//! 2. connect and identify the controller (probe fallback)
//! 3. map the identity to device capabilities
//! 4. scan every supported (device code, range) pair
//! 5. extract live devices
//! 6. register live devices with the monitor and start it
//!
//! State: `Idle -> Discovering -> {Monitoring | Idle} -> Stopping -> Idle`,
//! with `Error` reachable from any stage.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use errors::{PlcError, PlcResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::catalog::{
    DeviceCapabilityCatalog, DiscoveryMode, StaticCatalog, FALLBACK_DISPLAY_NAME,
    FALLBACK_TYPE_CODE,
};
use super::channel::ProtocolChannel;
use super::config::{AppConfig, TargetConfig};
use super::continuity::{ErrorContinuityPolicy, FaultSummary};
use super::events::{emit_quietly, DiscoveryEvent, EventSink};
use super::monitor::{AdaptiveMonitor, MonitorSettings, MonitoringStatistics};
use super::scanner::{BitThreshold, RangeScanner, ScanRequest, ScannerConfig, WordThreshold};
use super::types::{DeviceCode, DeviceValue, DiscoveryResult, TargetIdentity};

/// Address used for the liveness probe when identification fails
const PROBE_DEVICE: DeviceCode = DeviceCode::M;
const PROBE_ADDRESS: u32 = 0;

// ============================================================================
// State and Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemState {
    Idle,
    Discovering,
    Monitoring,
    Stopping,
    Error,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Idle => "IDLE",
            SystemState::Discovering => "DISCOVERING",
            SystemState::Monitoring => "MONITORING",
            SystemState::Stopping => "STOPPING",
            SystemState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub target: TargetConfig,
    pub mode: DiscoveryMode,
    pub min_active_devices_for_monitoring: usize,
    pub bit_threshold: BitThreshold,
    pub word_threshold: WordThreshold,
    pub batch_size: Option<usize>,
    pub max_concurrent_scans: Option<usize>,
    pub monitor: MonitorSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            target: config.target.clone(),
            mode: config.discovery.mode,
            min_active_devices_for_monitoring: config.discovery.min_active_devices_for_monitoring,
            bit_threshold: config.discovery.bit_threshold,
            word_threshold: config.discovery.word_threshold,
            batch_size: config.discovery.batch_size,
            max_concurrent_scans: config.discovery.max_concurrent_scans,
            monitor: config.monitoring.settings(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of one `start_discovery` call
#[derive(Debug, Clone)]
pub struct DiscoveryRun {
    pub session_id: Uuid,
    pub success: bool,
    /// `None` when the pipeline failed before scanning finished
    pub discovery: Option<DiscoveryResult>,
    /// Flat list of active addresses with the value that made them active
    pub live_devices: Vec<DeviceValue>,
    pub monitoring_started: bool,
    pub error_message: Option<String>,
    pub duration: Duration,
}

impl DiscoveryRun {
    pub fn fallback_used(&self) -> bool {
        self.discovery.as_ref().is_some_and(|d| d.fallback_used)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub monitored_count: usize,
    pub active_count: usize,
    pub last_discovery_duration: Option<Duration>,
    pub last_session_id: Option<Uuid>,
    pub monitoring: MonitoringStatistics,
    pub faults: FaultSummary,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} monitored={} active={} cycles={}/{} faults={} ({:.1}%)",
            self.state,
            self.monitored_count,
            self.active_count,
            self.monitoring.successful_cycles,
            self.monitoring.total_cycles(),
            self.faults.total_errors,
            self.faults.error_rate
        )?;
        if let Some(d) = self.last_discovery_duration {
            write!(f, " last_discovery={}ms", d.as_millis())?;
        }
        Ok(())
    }
}

struct PipelineOutcome {
    discovery: DiscoveryResult,
    live_devices: Vec<DeviceValue>,
    monitoring_started: bool,
}

struct Identification {
    identity: TargetIdentity,
    fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct LastRun {
    session_id: Uuid,
    duration: Duration,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct DiscoveryOrchestrator {
    settings: OrchestratorSettings,
    channel: Arc<dyn ProtocolChannel>,
    catalog: Arc<dyn DeviceCapabilityCatalog>,
    continuity: Arc<ErrorContinuityPolicy>,
    sink: Arc<dyn EventSink>,
    monitor: AdaptiveMonitor,
    state: RwLock<SystemState>,
    last_run: Mutex<Option<LastRun>>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        channel: Arc<dyn ProtocolChannel>,
        catalog: Arc<dyn DeviceCapabilityCatalog>,
        continuity: Arc<ErrorContinuityPolicy>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let monitor = AdaptiveMonitor::new(
            Arc::clone(&channel),
            Arc::clone(&continuity),
            Arc::clone(&sink),
            settings.monitor.clone(),
        );
        Self {
            settings,
            channel,
            catalog,
            continuity,
            sink,
            monitor,
            state: RwLock::new(SystemState::Idle),
            last_run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SystemState {
        *self.state.read()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &AdaptiveMonitor {
        &self.monitor
    }

    pub fn continuity(&self) -> &ErrorContinuityPolicy {
        &self.continuity
    }

    /// Run a discovery session
    ///
    /// Allowed from `Idle` or `Error`. Stage failures are reported in the
    /// returned run with `success = false`; the `Err` side is reserved for
    /// a rejected start (`State`) and cancellation (`Cancelled`).
    pub async fn start_discovery(&self, cancel: &CancellationToken) -> PlcResult<DiscoveryRun> {
        {
            let mut state = self.state.write();
            match *state {
                SystemState::Idle | SystemState::Error => *state = SystemState::Discovering,
                other => {
                    return Err(PlcError::State(format!(
                        "cannot start discovery while {}",
                        other
                    )))
                },
            }
        }

        let session_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            "Discovery session {} started for {} ({})",
            session_id,
            self.settings.target.display_name,
            self.settings.target.endpoint()
        );
        emit_quietly(
            self.sink.as_ref(),
            DiscoveryEvent::SessionStart {
                session_id,
                target: self.settings.target.display_name.clone(),
                mode: self.settings.mode.as_str().to_string(),
            },
        )
        .await;

        let outcome = self.run_pipeline(cancel).await;
        let duration = started.elapsed();
        *self.last_run.lock() = Some(LastRun {
            session_id,
            duration,
        });

        let (next_state, result) = match outcome {
            Ok(outcome) => {
                let next = if outcome.monitoring_started {
                    SystemState::Monitoring
                } else {
                    SystemState::Idle
                };
                info!(
                    "Discovery session {} finished in {}ms: {} live device(s), monitoring {}",
                    session_id,
                    duration.as_millis(),
                    outcome.live_devices.len(),
                    if outcome.monitoring_started {
                        "started"
                    } else {
                        "not started"
                    }
                );
                let run = DiscoveryRun {
                    session_id,
                    success: true,
                    discovery: Some(outcome.discovery),
                    live_devices: outcome.live_devices,
                    monitoring_started: outcome.monitoring_started,
                    error_message: None,
                    duration,
                };
                (next, Ok(run))
            },
            Err(PlcError::Cancelled) => {
                info!("Discovery session {} cancelled", session_id);
                (SystemState::Idle, Err(PlcError::Cancelled))
            },
            Err(e) => {
                error!(
                    "Discovery session {} failed [{}]: {}",
                    session_id,
                    e.error_code(),
                    e
                );
                let run = DiscoveryRun {
                    session_id,
                    success: false,
                    discovery: None,
                    live_devices: Vec::new(),
                    monitoring_started: false,
                    error_message: Some(e.to_string()),
                    duration,
                };
                (SystemState::Error, Ok(run))
            },
        };

        if next_state != SystemState::Monitoring {
            self.disconnect_quietly().await;
        }
        *self.state.write() = next_state;

        let end_event = match &result {
            Ok(run) => DiscoveryEvent::SessionEnd {
                session_id,
                success: run.success,
                duration_ms: duration.as_millis() as u64,
                active_devices: run.live_devices.len(),
                monitoring_started: run.monitoring_started,
                error: run.error_message.clone(),
            },
            Err(e) => DiscoveryEvent::SessionEnd {
                session_id,
                success: false,
                duration_ms: duration.as_millis() as u64,
                active_devices: 0,
                monitoring_started: false,
                error: Some(e.to_string()),
            },
        };
        emit_quietly(self.sink.as_ref(), end_event).await;
        result
    }

    async fn run_pipeline(&self, cancel: &CancellationToken) -> PlcResult<PipelineOutcome> {
        let started = Instant::now();

        // 1. target
        debug!("Stage 1/6: target parameters");
        self.settings.target.validate()?;
        ensure_not_cancelled(cancel)?;

        // 2. connect and identify
        debug!("Stage 2/6: connect and identify");
        let Identification {
            identity,
            fallback_reason,
        } = self.connect_and_identify().await?;
        ensure_not_cancelled(cancel)?;

        // 3. capabilities
        debug!("Stage 3/6: capability mapping for {}", identity);
        let capabilities = self.catalog.get_supported_devices(identity.type_code);
        if capabilities.is_empty() {
            let gap = PlcError::ConfigurationGap(format!(
                "no usable devices for {} in {} mode",
                identity,
                self.settings.mode.as_str()
            ));
            warn!("{}, finishing with an empty result", gap);
            return Ok(PipelineOutcome {
                discovery: DiscoveryResult {
                    target: identity,
                    scan_results: Vec::new(),
                    total_duration: started.elapsed(),
                    fallback_used: fallback_reason.is_some(),
                    fallback_reason,
                },
                live_devices: Vec::new(),
                monitoring_started: false,
            });
        }
        info!(
            "{} series, {} device code(s) to scan",
            capabilities.series,
            capabilities.device_count()
        );

        // 4. scan
        let batch_size = self
            .settings
            .batch_size
            .unwrap_or(capabilities.recommended_batch_size);
        let concurrency = self
            .settings
            .max_concurrent_scans
            .unwrap_or(capabilities.recommended_concurrency);
        StaticCatalog::validate(batch_size, concurrency)?;
        debug!(
            "Stage 4/6: scan with batch {} and concurrency {}",
            batch_size, concurrency
        );

        let scanner = RangeScanner::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.continuity),
            ScannerConfig {
                bit_threshold: self.settings.bit_threshold,
                word_threshold: self.settings.word_threshold,
                max_concurrent_scans: concurrency,
            },
        )
        .with_legal_ranges(&capabilities);
        let requests: Vec<ScanRequest> = capabilities
            .ranges
            .iter()
            .map(|d| ScanRequest {
                code: d.code,
                range: d.range,
            })
            .collect();
        let scan_results = scanner.scan_devices(&requests, batch_size, cancel).await?;
        ensure_not_cancelled(cancel)?;

        let discovery = DiscoveryResult {
            target: identity,
            scan_results,
            total_duration: started.elapsed(),
            fallback_used: fallback_reason.is_some(),
            fallback_reason,
        };

        // 5. live devices
        let live_devices: Vec<DeviceValue> = discovery
            .scan_results
            .iter()
            .flat_map(|r| r.active_values().cloned())
            .collect();
        let stats = discovery.overall_statistics();
        info!(
            "Stage 5/6: {} live of {} scanned address(es), batch success {:.1}%",
            live_devices.len(),
            discovery.total_scanned_addresses(),
            stats.success_rate()
        );

        // 6. monitoring
        let min = self.settings.min_active_devices_for_monitoring;
        let monitoring_started = if !live_devices.is_empty() && live_devices.len() >= min {
            self.monitor
                .register_devices(live_devices.iter().map(|v| v.address));
            self.monitor.start_monitoring()?;
            true
        } else {
            info!(
                "Stage 6/6: {} live device(s), below the monitoring minimum of {}",
                live_devices.len(),
                min.max(1)
            );
            false
        };

        Ok(PipelineOutcome {
            discovery,
            live_devices,
            monitoring_started,
        })
    }

    async fn connect_and_identify(&self) -> PlcResult<Identification> {
        self.channel.connect().await?;

        match self.channel.identify_target().await {
            Ok(identity) => {
                info!("Identified target {}", identity);
                Ok(Identification {
                    identity,
                    fallback_reason: None,
                })
            },
            Err(fault) => {
                warn!("Target identification failed: {}", fault);
                if !self.channel.is_alive().await {
                    return Err(fault.into());
                }
                let probe = RangeScanner::new(
                    Arc::clone(&self.channel),
                    Arc::clone(&self.continuity),
                    ScannerConfig::default(),
                );
                if !probe.probe(PROBE_DEVICE, PROBE_ADDRESS).await {
                    return Err(fault.into());
                }
                let identity = TargetIdentity {
                    display_name: FALLBACK_DISPLAY_NAME.to_string(),
                    type_code: FALLBACK_TYPE_CODE,
                };
                warn!(
                    "Target answered a liveness probe, continuing as {}",
                    identity
                );
                Ok(Identification {
                    identity,
                    fallback_reason: Some(fault.to_string()),
                })
            },
        }
    }

    /// Stop the monitor and return to `Idle`
    pub async fn stop_monitoring(&self) {
        {
            let mut state = self.state.write();
            if *state != SystemState::Monitoring {
                debug!("Stop requested while {}, nothing to stop", *state);
                return;
            }
            *state = SystemState::Stopping;
        }
        self.monitor.stop_monitoring().await;
        self.disconnect_quietly().await;
        *self.state.write() = SystemState::Idle;
    }

    pub fn status_report(&self) -> StatusReport {
        let last = *self.last_run.lock();
        StatusReport {
            state: self.state(),
            monitored_count: self.monitor.monitored_count(),
            active_count: self.monitor.active_count(),
            last_discovery_duration: last.map(|l| l.duration),
            last_session_id: last.map(|l| l.session_id),
            monitoring: self.monitor.statistics(),
            faults: self.continuity.summary(),
        }
    }

    async fn disconnect_quietly(&self) {
        if let Err(e) = self.channel.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.channel.name(), e);
        }
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> PlcResult<()> {
    if cancel.is_cancelled() {
        return Err(PlcError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::continuity::ContinuityMode;
    use crate::core::events::MemoryEventSink;
    use crate::core::simulator::SimulatedChannel;

    fn q_cpu() -> TargetIdentity {
        TargetIdentity {
            display_name: "Q02CPU".to_string(),
            type_code: 0x0041,
        }
    }

    fn basic_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            mode: DiscoveryMode::Basic,
            ..Default::default()
        }
    }

    fn orchestrator(
        sim: Arc<SimulatedChannel>,
        settings: OrchestratorSettings,
    ) -> (Arc<MemoryEventSink>, DiscoveryOrchestrator) {
        let sink = MemoryEventSink::new();
        let continuity = Arc::new(ErrorContinuityPolicy::new(
            crate::core::continuity::ContinuitySettings {
                mode: ContinuityMode::ReturnDefaultAndContinue,
                ..Default::default()
            },
            sink.clone(),
        ));
        let catalog = Arc::new(StaticCatalog::new(settings.mode));
        let orch = DiscoveryOrchestrator::new(settings, sim, catalog, continuity, sink.clone());
        (sink, orch)
    }

    #[tokio::test]
    async fn test_discovery_starts_monitoring_for_live_devices() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        sim.set_bit(DeviceCode::M, 100, true);
        sim.set_word(DeviceCode::D, 7, 42);
        let (sink, orch) = orchestrator(sim.clone(), basic_settings());

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(run.success);
        assert!(!run.fallback_used());
        assert_eq!(run.live_devices.len(), 2);
        assert!(run.monitoring_started);
        assert_eq!(orch.state(), SystemState::Monitoring);
        assert_eq!(orch.monitor().monitored_count(), 2);

        // a second start is rejected while monitoring
        let err = orch
            .start_discovery(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::State(_)));

        orch.stop_monitoring().await;
        assert_eq!(orch.state(), SystemState::Idle);
        assert!(!orch.monitor().is_monitoring());
        assert_eq!(sink.count("session_start"), 1);
        assert_eq!(sink.count("session_end"), 1);
    }

    #[tokio::test]
    async fn test_no_live_devices_is_success_without_monitoring() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        let (_sink, orch) = orchestrator(sim, basic_settings());

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(run.success);
        assert!(run.live_devices.is_empty());
        assert!(!run.monitoring_started);
        assert_eq!(orch.state(), SystemState::Idle);
        assert_eq!(run.discovery.unwrap().scan_results.len(), 6);
    }

    #[tokio::test]
    async fn test_minimum_live_devices_gate() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        sim.set_bit(DeviceCode::M, 1, true);
        let settings = OrchestratorSettings {
            min_active_devices_for_monitoring: 2,
            ..basic_settings()
        };
        let (_sink, orch) = orchestrator(sim, settings);

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(run.success);
        assert_eq!(run.live_devices.len(), 1);
        assert!(!run.monitoring_started);
    }

    #[tokio::test]
    async fn test_identification_fallback() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        sim.fail_identification(true);
        let (_sink, orch) = orchestrator(sim, basic_settings());

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(run.success);
        assert!(run.fallback_used());
        let discovery = run.discovery.unwrap();
        assert_eq!(discovery.target.display_name, FALLBACK_DISPLAY_NAME);
        assert_eq!(discovery.target.type_code, FALLBACK_TYPE_CODE);
        assert!(discovery.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn test_invalid_target_moves_to_error_and_recovers() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        let mut settings = basic_settings();
        settings.target.port = 0;
        let (sink, orch) = orchestrator(sim, settings);

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(!run.success);
        assert!(run.error_message.is_some());
        assert_eq!(orch.state(), SystemState::Error);
        assert_eq!(sink.count("session_end"), 1);

        // a new session may start from Error
        let again = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(!again.success);
    }

    #[tokio::test]
    async fn test_cancelled_discovery_returns_to_idle() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        let (sink, orch) = orchestrator(sim.clone(), basic_settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.start_discovery(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(orch.state(), SystemState::Idle);
        assert_eq!(sink.count("session_end"), 1);
        assert_eq!(sim.read_call_count(), 0);
    }

    #[tokio::test]
    async fn test_status_report() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        let (_sink, orch) = orchestrator(sim, basic_settings());
        let before = orch.status_report();
        assert_eq!(before.state, SystemState::Idle);
        assert!(before.last_discovery_duration.is_none());

        orch.start_discovery(&CancellationToken::new()).await.unwrap();
        let after = orch.status_report();
        assert!(after.last_discovery_duration.is_some());
        assert!(after.to_string().contains("state=IDLE"));
    }

    #[tokio::test]
    async fn test_lost_link_during_identification_skips_fallback() {
        let sim = Arc::new(SimulatedChannel::new(q_cpu()));
        sim.set_bit(DeviceCode::M, 0, true);
        sim.drop_on_identify(true);
        let (sink, orch) = orchestrator(sim.clone(), basic_settings());

        let run = orch.start_discovery(&CancellationToken::new()).await.unwrap();
        assert!(!run.success);
        assert!(!run.fallback_used());
        assert!(run.error_message.unwrap().contains("disconnected"));
        assert_eq!(orch.state(), SystemState::Error);
        // no liveness read of M0 on a dead link
        assert_eq!(sim.read_call_count(), 0);
        assert_eq!(sink.count("session_end"), 1);
    }
}
