//! PLC Device Discovery Service Library (discsrv)
//!
//! Discovers which device addresses of a programmable controller hold live
//! data and keeps polling them adaptively.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Orchestrator   │───►│  RangeScanner   │───►│ ProtocolChannel │
//! │  (6 stages)     │    │  (batched scan) │    │ (block reads)   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                      │                      ▲
//!          ▼                      ▼                      │
//! ┌─────────────────┐    ┌─────────────────┐             │
//! │ AdaptiveMonitor │───►│ ContinuityPolicy│─────────────┘
//! │ (cycle loop)    │    │ (fault absorb)  │
//! └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`core`**: pipeline components, configuration and the simulated target
//! - **`runtime`**: service lifecycle and the periodic status reporter

pub mod core;
pub mod runtime;

pub use crate::core::catalog::{
    DeviceCapabilities, DeviceCapabilityCatalog, DiscoveryMode, PlcSeries, StaticCatalog,
};
pub use crate::core::channel::ProtocolChannel;
pub use crate::core::config::AppConfig;
pub use crate::core::continuity::{ContinuityMode, ContinuitySettings, ErrorContinuityPolicy};
pub use crate::core::events::{DiscoveryEvent, EventSink, MemoryEventSink, TracingEventSink};
pub use crate::core::monitor::{AdaptiveMonitor, MonitorSettings, MonitoringStatistics};
pub use crate::core::orchestrator::{
    DiscoveryOrchestrator, DiscoveryRun, OrchestratorSettings, StatusReport, SystemState,
};
pub use crate::core::scanner::{
    BitThreshold, RangeScanner, ScanRequest, ScannerConfig, WordThreshold,
};
pub use crate::core::simulator::SimulatedChannel;
pub use crate::core::types::{
    AddressRange, DeviceAddress, DeviceCode, DeviceKind, DeviceValue, DiscoveryResult,
    ScanResult, ScanStatistics, TargetIdentity, Value,
};
pub use errors::{CommunicationFault, FaultKind, PlcError, PlcResult};
