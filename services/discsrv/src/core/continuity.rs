//! Error continuity policy
//!
//! Every block read made by the scanner and the monitor goes through
//! `ErrorContinuityPolicy`. Depending on the configured mode a communication
//! fault either propagates or is recorded and replaced by a default-valued
//! block of the requested length.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{CommunicationFault, FaultKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::channel::ProtocolChannel;
use super::events::{emit_quietly, DiscoveryEvent, EventSink, TracingEventSink};
use super::types::DeviceCode;

/// Operations needed before the fault-rate warning may fire
const MIN_OPERATIONS_FOR_RATE_WARNING: u64 = 10;
/// Number of fault keys listed in a summary
const TOP_FAULTS: usize = 10;

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityMode {
    /// Faults propagate unchanged
    ThrowException,
    /// Faults are recorded and replaced by default values
    #[default]
    ReturnDefaultAndContinue,
    /// Same as `ReturnDefaultAndContinue`; no retry is performed
    RetryThenDefault,
}

impl ContinuityMode {
    pub fn absorbs_faults(self) -> bool {
        !matches!(self, ContinuityMode::ThrowException)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContinuityMode::ThrowException => "throw_exception",
            ContinuityMode::ReturnDefaultAndContinue => "return_default_and_continue",
            ContinuityMode::RetryThenDefault => "retry_then_default",
        }
    }
}

impl fmt::Display for ContinuityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuitySettings {
    pub mode: ContinuityMode,
    pub default_bit_value: bool,
    pub default_word_value: u16,
    /// Minimum gap between two warnings for the same fault key
    pub notification_interval: Duration,
    /// Fault rate (percent of operations) that triggers a one-off warning
    pub error_rate_warning_percent: f64,
}

impl Default for ContinuitySettings {
    fn default() -> Self {
        Self {
            mode: ContinuityMode::ReturnDefaultAndContinue,
            default_bit_value: false,
            default_word_value: 0,
            notification_interval: Duration::from_secs(30),
            error_rate_warning_percent: 10.0,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics key: one fault kind at one block start address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultKey {
    pub kind: FaultKind,
    pub code: DeviceCode,
    pub address: u32,
}

impl fmt::Display for FaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.code, self.address)
    }
}

#[derive(Debug, Clone)]
struct FaultEntry {
    count: u64,
    last_message: String,
    last_seen: DateTime<Utc>,
}

/// Running counters of guarded operations and their faults
#[derive(Debug, Clone, Default)]
pub struct FaultStatistics {
    pub total_operations: u64,
    pub total_errors: u64,
    pub continued_operations: u64,
    entries: HashMap<FaultKey, FaultEntry>,
}

impl FaultStatistics {
    /// Faults as a percentage of all guarded operations
    pub fn error_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_operations as f64 * 100.0
    }

    /// Share of faults that were absorbed instead of propagated
    pub fn continuity_rate(&self) -> f64 {
        if self.total_errors == 0 {
            return 100.0;
        }
        self.continued_operations as f64 / self.total_errors as f64 * 100.0
    }

    pub fn count_for(&self, key: &FaultKey) -> u64 {
        self.entries.get(key).map_or(0, |e| e.count)
    }

    pub fn summary(&self) -> FaultSummary {
        let mut top: Vec<TopFault> = self
            .entries
            .iter()
            .map(|(key, entry)| TopFault {
                key: key.to_string(),
                count: entry.count,
                last_message: entry.last_message.clone(),
                last_seen: entry.last_seen,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        top.truncate(TOP_FAULTS);

        FaultSummary {
            total_operations: self.total_operations,
            total_errors: self.total_errors,
            continued_operations: self.continued_operations,
            error_rate: self.error_rate(),
            continuity_rate: self.continuity_rate(),
            top_errors: top,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopFault {
    pub key: String,
    pub count: u64,
    pub last_message: String,
    pub last_seen: DateTime<Utc>,
}

/// Point-in-time view of the fault statistics
#[derive(Debug, Clone, Serialize)]
pub struct FaultSummary {
    pub total_operations: u64,
    pub total_errors: u64,
    pub continued_operations: u64,
    pub error_rate: f64,
    pub continuity_rate: f64,
    pub top_errors: Vec<TopFault>,
}

// ============================================================================
// Policy
// ============================================================================

/// Guards block reads according to the configured `ContinuityMode`
pub struct ErrorContinuityPolicy {
    settings: ContinuitySettings,
    stats: Mutex<FaultStatistics>,
    last_notified: DashMap<FaultKey, Instant>,
    rate_warning_active: AtomicBool,
    retry_notice_logged: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl ErrorContinuityPolicy {
    pub fn new(settings: ContinuitySettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            stats: Mutex::new(FaultStatistics::default()),
            last_notified: DashMap::new(),
            rate_warning_active: AtomicBool::new(false),
            retry_notice_logged: AtomicBool::new(false),
            sink,
        }
    }

    /// Policy with the given mode, default values and a tracing sink
    pub fn with_mode(mode: ContinuityMode) -> Self {
        Self::new(
            ContinuitySettings {
                mode,
                ..Default::default()
            },
            Arc::new(TracingEventSink),
        )
    }

    pub fn settings(&self) -> &ContinuitySettings {
        &self.settings
    }

    pub fn mode(&self) -> ContinuityMode {
        self.settings.mode
    }

    /// Guarded bit-block read
    pub async fn read_bits(
        &self,
        channel: &dyn ProtocolChannel,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<bool>, CommunicationFault> {
        let default = self.settings.default_bit_value;
        self.guarded(
            code,
            address,
            count,
            channel.read_bits(code, address, count),
            default,
        )
        .await
    }

    /// Guarded word-block read
    pub async fn read_words(
        &self,
        channel: &dyn ProtocolChannel,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<u16>, CommunicationFault> {
        let default = self.settings.default_word_value;
        self.guarded(
            code,
            address,
            count,
            channel.read_words(code, address, count),
            default,
        )
        .await
    }

    async fn guarded<T, F>(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
        read: F,
        default: T,
    ) -> Result<Vec<T>, CommunicationFault>
    where
        T: Clone,
        F: Future<Output = Result<Vec<T>, CommunicationFault>>,
    {
        let started = Instant::now();
        let result = read.await;
        emit_quietly(
            self.sink.as_ref(),
            DiscoveryEvent::Communication {
                code,
                address,
                count,
                duration_ms: started.elapsed().as_millis() as u64,
                success: result.is_ok(),
            },
        )
        .await;

        match result {
            Ok(values) => {
                self.record_success();
                Ok(values)
            },
            Err(fault) => {
                self.absorb(&fault, code, address).await;
                if self.settings.mode.absorbs_faults() {
                    Ok(vec![default; count])
                } else {
                    Err(fault)
                }
            },
        }
    }

    fn record_success(&self) {
        let rate = {
            let mut stats = self.stats.lock();
            stats.total_operations += 1;
            stats.error_rate()
        };
        if rate < self.settings.error_rate_warning_percent {
            self.rate_warning_active.store(false, Ordering::Relaxed);
        }
    }

    async fn absorb(&self, fault: &CommunicationFault, code: DeviceCode, address: u32) {
        let key = FaultKey {
            kind: fault.kind,
            code,
            address,
        };
        let continued = self.settings.mode.absorbs_faults();

        let (count, rate, operations) = {
            let mut stats = self.stats.lock();
            stats.total_operations += 1;
            stats.total_errors += 1;
            if continued {
                stats.continued_operations += 1;
            }
            let entry = stats.entries.entry(key).or_insert_with(|| FaultEntry {
                count: 0,
                last_message: String::new(),
                last_seen: Utc::now(),
            });
            entry.count += 1;
            entry.last_message.clone_from(&fault.message);
            entry.last_seen = Utc::now();
            let count = entry.count;
            (count, stats.error_rate(), stats.total_operations)
        };

        if self.should_notify(key) {
            warn!(
                "Communication fault [{}]: {} (x{}, mode {})",
                key, fault.message, count, self.settings.mode
            );
        } else {
            debug!("Communication fault [{}]: {}", key, fault.message);
        }

        if operations >= MIN_OPERATIONS_FOR_RATE_WARNING
            && rate >= self.settings.error_rate_warning_percent
            && !self.rate_warning_active.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Fault rate {:.1}% crossed {:.1}% over {} operations, continuing degraded",
                rate, self.settings.error_rate_warning_percent, operations
            );
        }

        if self.settings.mode == ContinuityMode::RetryThenDefault
            && !self.retry_notice_logged.swap(true, Ordering::Relaxed)
        {
            debug!("retry_then_default: retries are not performed, defaults are substituted");
        }

        emit_quietly(
            self.sink.as_ref(),
            DiscoveryEvent::Error {
                kind: fault.kind,
                code,
                address,
                message: fault.message.clone(),
                continued,
            },
        )
        .await;
    }

    /// At most one warning per key per notification interval
    fn should_notify(&self, key: FaultKey) -> bool {
        let now = Instant::now();
        let mut notify = false;
        self.last_notified
            .entry(key)
            .and_modify(|last| {
                if now.duration_since(*last) >= self.settings.notification_interval {
                    *last = now;
                    notify = true;
                }
            })
            .or_insert_with(|| {
                notify = true;
                now
            });
        notify
    }

    pub fn statistics(&self) -> FaultStatistics {
        self.stats.lock().clone()
    }

    pub fn summary(&self) -> FaultSummary {
        self.stats.lock().summary()
    }

    pub fn total_errors(&self) -> u64 {
        self.stats.lock().total_errors
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = FaultStatistics::default();
        self.last_notified.clear();
        self.rate_warning_active.store(false, Ordering::Relaxed);
    }
}

impl fmt::Debug for ErrorContinuityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorContinuityPolicy")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
