//! End-to-end pipeline scenarios against the simulated controller

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::Arc;

use discsrv::core::catalog::{DeviceCapabilities, PlcSeries, FALLBACK_TYPE_CODE};
use discsrv::core::continuity::FaultKey;
use discsrv::core::events::MemoryEventSink;
use discsrv::core::monitor::MonitorSettings;
use discsrv::{
    AddressRange, AdaptiveMonitor, ContinuityMode, ContinuitySettings, DeviceAddress,
    DeviceCapabilityCatalog, DeviceCode, DiscoveryMode, DiscoveryOrchestrator,
    ErrorContinuityPolicy, EventSink, FaultKind, OrchestratorSettings, ProtocolChannel,
    RangeScanner, ScannerConfig, SimulatedChannel, StaticCatalog, SystemState, TargetIdentity,
    Value,
};
use tokio_util::sync::CancellationToken;

fn q02() -> TargetIdentity {
    TargetIdentity {
        display_name: "Q02CPU".to_string(),
        type_code: 0x0041,
    }
}

async fn connected_sim() -> Arc<SimulatedChannel> {
    let sim = Arc::new(SimulatedChannel::new(q02()));
    sim.connect().await.unwrap();
    sim
}

fn policy(mode: ContinuityMode, sink: Arc<dyn EventSink>) -> Arc<ErrorContinuityPolicy> {
    Arc::new(ErrorContinuityPolicy::new(
        ContinuitySettings {
            mode,
            ..Default::default()
        },
        sink,
    ))
}

/// Catalog that knows no devices for any target
struct EmptyCatalog;

impl DeviceCapabilityCatalog for EmptyCatalog {
    fn get_supported_devices(&self, _type_code: u16) -> DeviceCapabilities {
        DeviceCapabilities {
            series: PlcSeries::Unknown,
            bit_device_codes: Vec::new(),
            word_device_codes: Vec::new(),
            ranges: Vec::new(),
            recommended_batch_size: 32,
            recommended_concurrency: 4,
        }
    }
}

#[tokio::test]
async fn scan_of_m0_to_m99_uses_four_batches() {
    let sim = connected_sim().await;
    let scanner = RangeScanner::new(
        sim.clone(),
        policy(ContinuityMode::ReturnDefaultAndContinue, MemoryEventSink::new()),
        ScannerConfig::default(),
    );

    let result = scanner
        .scan_range(
            DeviceCode::M,
            AddressRange::new(0, 99, 3).unwrap(),
            32,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let spans: Vec<(u32, u32)> = sim.read_log().iter().map(|c| (c.address, c.end())).collect();
    assert_eq!(spans, vec![(0, 31), (32, 63), (64, 95), (96, 99)]);
    assert_eq!(result.all_values.len(), 100);
    assert_eq!(result.statistics.successful_batches, 4);
    assert_eq!(result.statistics.failed_batches, 0);
}

#[tokio::test]
async fn monitor_counts_one_change_per_differing_cycle() {
    let sim = connected_sim().await;
    let sink = MemoryEventSink::new();
    let monitor = AdaptiveMonitor::new(
        sim.clone(),
        policy(ContinuityMode::ReturnDefaultAndContinue, sink.clone()),
        sink,
        MonitorSettings::default(),
    );
    let m10 = DeviceAddress::new(DeviceCode::M, 10);
    let m11 = DeviceAddress::new(DeviceCode::M, 11);
    let d5 = DeviceAddress::new(DeviceCode::D, 5);
    monitor.register_devices([m10, m11, d5]);

    sim.set_bit(DeviceCode::M, 10, true);
    sim.set_word(DeviceCode::D, 5, 7);

    monitor.run_cycle().await;
    let counts = |m: &AdaptiveMonitor| {
        [m10, m11, d5].map(|a| m.snapshot(&a).unwrap().change_count)
    };
    assert_eq!(counts(&monitor), [1, 1, 1]);

    monitor.run_cycle().await;
    assert_eq!(counts(&monitor), [1, 1, 1]);

    sim.set_bit(DeviceCode::M, 10, false);
    monitor.run_cycle().await;
    assert_eq!(counts(&monitor), [2, 1, 1]);
    assert_eq!(monitor.snapshot(&d5).unwrap().last_value, Some(Value::Word(7)));

    // overlapping re-registration keeps counters
    monitor.register_devices([m10, d5]);
    assert_eq!(counts(&monitor), [2, 1, 1]);
}

#[tokio::test]
async fn empty_capability_mapping_still_succeeds() {
    let sim = Arc::new(SimulatedChannel::new(q02()));
    let sink = MemoryEventSink::new();
    let orchestrator = DiscoveryOrchestrator::new(
        OrchestratorSettings::default(),
        sim.clone(),
        Arc::new(EmptyCatalog),
        policy(ContinuityMode::ReturnDefaultAndContinue, sink.clone()),
        sink.clone(),
    );

    let run = orchestrator
        .start_discovery(&CancellationToken::new())
        .await
        .unwrap();
    assert!(run.success);
    assert!(!run.monitoring_started);
    assert!(run.discovery.unwrap().scan_results.is_empty());
    assert_eq!(orchestrator.state(), SystemState::Idle);
    assert_eq!(sim.read_call_count(), 0);
    assert_eq!(sink.count("session_start"), 1);
    assert_eq!(sink.count("session_end"), 1);
}

#[tokio::test]
async fn faulted_bit_batch_is_skipped_and_scan_continues() {
    let sim = connected_sim().await;
    sim.inject_fault(DeviceCode::M, 50);
    sim.set_bit(DeviceCode::M, 40, true);
    sim.set_bit(DeviceCode::M, 70, true);

    let continuity = policy(ContinuityMode::ThrowException, MemoryEventSink::new());
    let scanner = RangeScanner::new(sim.clone(), continuity.clone(), ScannerConfig::default());
    let result = scanner
        .scan_range(
            DeviceCode::M,
            AddressRange::new(0, 127, 3).unwrap(),
            32,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.statistics.failed_batches, 1);
    assert_eq!(result.statistics.successful_batches, 3);
    assert_eq!(result.all_values.len(), 96);
    assert!(result
        .all_values
        .iter()
        .all(|v| !(32..=63).contains(&v.address.address)));
    assert!(!result.is_active(&DeviceAddress::new(DeviceCode::M, 40)));
    assert!(result.is_active(&DeviceAddress::new(DeviceCode::M, 70)));
    // the read after the faulted block was still issued
    assert_eq!(sim.read_log().last().unwrap().address, 96);
    assert_eq!(continuity.total_errors(), 1);
}

#[tokio::test]
async fn default_mode_hides_faults_from_callers() {
    let sim = connected_sim().await;
    sim.inject_fault(DeviceCode::D, 3);
    let continuity = policy(ContinuityMode::ReturnDefaultAndContinue, MemoryEventSink::new());

    let words = continuity
        .read_words(sim.as_ref(), DeviceCode::D, 0, 10)
        .await
        .unwrap();
    assert_eq!(words, vec![0; 10]);

    let stats = continuity.statistics();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(
        stats.count_for(&FaultKey {
            kind: FaultKind::Timeout,
            code: DeviceCode::D,
            address: 0,
        }),
        1
    );
}

#[tokio::test]
async fn failed_identification_falls_back_to_default_identity() {
    let sim = Arc::new(SimulatedChannel::new(q02()));
    sim.fail_identification(true);
    sim.set_word(DeviceCode::D, 10, 99);
    let sink = MemoryEventSink::new();
    let settings = OrchestratorSettings {
        mode: DiscoveryMode::Basic,
        ..Default::default()
    };
    let orchestrator = DiscoveryOrchestrator::new(
        settings,
        sim,
        Arc::new(StaticCatalog::new(DiscoveryMode::Basic)),
        policy(ContinuityMode::ReturnDefaultAndContinue, sink.clone()),
        sink,
    );

    let run = orchestrator
        .start_discovery(&CancellationToken::new())
        .await
        .unwrap();
    assert!(run.success);
    assert!(run.fallback_used());
    assert_eq!(run.discovery.as_ref().unwrap().target.type_code, FALLBACK_TYPE_CODE);
    assert_eq!(run.live_devices.len(), 1);
    assert!(run.monitoring_started);

    orchestrator.stop_monitoring().await;
    assert_eq!(orchestrator.state(), SystemState::Idle);
}

#[tokio::test]
async fn failing_event_sink_does_not_change_results() {
    let sim = Arc::new(SimulatedChannel::new(q02()));
    sim.set_bit(DeviceCode::M, 3, true);
    sim.inject_fault(DeviceCode::D, 0);
    let sink = MemoryEventSink::failing();
    let settings = OrchestratorSettings {
        mode: DiscoveryMode::Basic,
        ..Default::default()
    };
    let orchestrator = DiscoveryOrchestrator::new(
        settings,
        sim,
        Arc::new(StaticCatalog::new(DiscoveryMode::Basic)),
        policy(ContinuityMode::ReturnDefaultAndContinue, sink.clone()),
        sink.clone(),
    );

    let run = orchestrator
        .start_discovery(&CancellationToken::new())
        .await
        .unwrap();
    assert!(run.success);
    assert_eq!(run.live_devices.len(), 1);
    assert!(sink.events().is_empty());
    assert_eq!(orchestrator.continuity().total_errors(), 1);
    orchestrator.stop_monitoring().await;
}

#[tokio::test]
async fn unreachable_target_reports_error_state() {
    let sim = Arc::new(SimulatedChannel::new(q02()));
    sim.fail_identification(true);
    sim.inject_fault(DeviceCode::M, 0);
    let sink = MemoryEventSink::new();
    let orchestrator = DiscoveryOrchestrator::new(
        OrchestratorSettings::default(),
        sim,
        Arc::new(StaticCatalog::default()),
        policy(ContinuityMode::ReturnDefaultAndContinue, sink.clone()),
        sink.clone(),
    );

    let run = orchestrator
        .start_discovery(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!run.success);
    assert!(run.error_message.unwrap().contains("malformed"));
    assert_eq!(orchestrator.state(), SystemState::Error);
    assert_eq!(sink.count("session_end"), 1);
}
