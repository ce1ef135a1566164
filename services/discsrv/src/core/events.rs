//! Structured pipeline events
//!
//! Session, cycle, communication and error events handed to an `EventSink`.
//! Emission is fire-and-forget: a failing sink never changes pipeline results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use errors::{FaultKind, PlcError, PlcResult};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::types::DeviceCode;

/// Event emitted by the scanner, monitor, continuity policy or orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    SessionStart {
        session_id: Uuid,
        target: String,
        mode: String,
    },
    SessionEnd {
        session_id: Uuid,
        success: bool,
        duration_ms: u64,
        active_devices: usize,
        monitoring_started: bool,
        error: Option<String>,
    },
    CycleStart {
        cycle: u64,
        candidates: usize,
    },
    Communication {
        code: DeviceCode,
        address: u32,
        count: usize,
        duration_ms: u64,
        success: bool,
    },
    Error {
        kind: FaultKind,
        code: DeviceCode,
        address: u32,
        message: String,
        /// Whether a default value was substituted and execution continued
        continued: bool,
    },
}

impl DiscoveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::SessionStart { .. } => "session_start",
            DiscoveryEvent::SessionEnd { .. } => "session_end",
            DiscoveryEvent::CycleStart { .. } => "cycle_start",
            DiscoveryEvent::Communication { .. } => "communication",
            DiscoveryEvent::Error { .. } => "error",
        }
    }
}

/// Logging/telemetry collaborator
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &DiscoveryEvent) -> PlcResult<()>;
}

/// Emit an event and swallow any sink failure
pub async fn emit_quietly(sink: &dyn EventSink, event: DiscoveryEvent) {
    if let Err(e) = sink.emit(&event).await {
        debug!("Event sink dropped {}: {}", event.name(), e);
    }
}

/// Writes events as JSON lines on the `discovery_events` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &DiscoveryEvent) -> PlcResult<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| PlcError::Internal(format!("event serialization: {}", e)))?;
        match event {
            DiscoveryEvent::SessionStart { .. } | DiscoveryEvent::SessionEnd { .. } => {
                info!(target: "discovery_events", "{}", payload)
            },
            DiscoveryEvent::CycleStart { .. } => debug!(target: "discovery_events", "{}", payload),
            DiscoveryEvent::Communication { .. } => {
                trace!(target: "discovery_events", "{}", payload)
            },
            DiscoveryEvent::Error { .. } => warn!(target: "discovery_events", "{}", payload),
        }
        Ok(())
    }
}

/// Sink that keeps events in memory; can be told to fail
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DiscoveryEvent>>,
    failing: AtomicBool,
}

impl MemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink whose every `emit` returns an error
    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.failing.store(true, Ordering::Relaxed);
        Arc::new(sink)
    }

    pub fn events(&self) -> Vec<DiscoveryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn emit(&self, event: &DiscoveryEvent) -> PlcResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PlcError::Internal("event sink unavailable".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_events() {
        let sink = MemoryEventSink::new();
        emit_quietly(
            sink.as_ref(),
            DiscoveryEvent::CycleStart {
                cycle: 1,
                candidates: 3,
            },
        )
        .await;
        assert_eq!(sink.count("cycle_start"), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let sink = MemoryEventSink::failing();
        emit_quietly(
            sink.as_ref(),
            DiscoveryEvent::CycleStart {
                cycle: 1,
                candidates: 0,
            },
        )
        .await;
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_event_json_shape() {
        let event = DiscoveryEvent::Error {
            kind: FaultKind::Timeout,
            code: DeviceCode::M,
            address: 32,
            message: "no reply".to_string(),
            continued: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["code"], "M");
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_all_events() {
        let sink = TracingEventSink;
        let id = Uuid::new_v4();
        assert!(sink
            .emit(&DiscoveryEvent::SessionStart {
                session_id: id,
                target: "Q02CPU".to_string(),
                mode: "comprehensive".to_string(),
            })
            .await
            .is_ok());
    }
}
