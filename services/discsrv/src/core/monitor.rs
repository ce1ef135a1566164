//! Adaptive monitor
//!
//! Periodically re-reads registered live devices. Each cycle selects the
//! fresh, most frequently changing devices up to a cap, groups them into
//! contiguous block reads and issues the bit group and the word group
//! concurrently. Value changes bump a per-device counter that drives the
//! next cycle's selection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{CommunicationFault, PlcError, PlcResult};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{protocol_max, ProtocolChannel};
use super::continuity::ErrorContinuityPolicy;
use super::events::{emit_quietly, DiscoveryEvent, EventSink};
use super::types::{DeviceAddress, DeviceCode, DeviceKind, DeviceValue, MonitoringCycleResult, Value};

// ============================================================================
// Settings and State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub max_batch_size: usize,
    pub max_concurrent_operations: usize,
    /// Devices not refreshed within this window are no longer polled
    pub inactive_device_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_batch_size: 32,
            max_concurrent_operations: 4,
            inactive_device_timeout: Duration::from_secs(300),
        }
    }
}

impl MonitorSettings {
    /// Devices polled per cycle at most
    pub fn candidate_cap(&self) -> usize {
        self.max_batch_size.max(1) * self.max_concurrent_operations.max(1)
    }
}

/// Per-device monitoring state
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredDevice {
    pub address: DeviceAddress,
    /// `None` until the first successful read
    pub last_value: Option<Value>,
    /// Refreshed on every successful read; drives staleness
    pub last_seen: Instant,
    /// Wall-clock time of registration or of the last value change
    pub last_changed: DateTime<Utc>,
    pub change_count: u64,
}

impl MonitoredDevice {
    fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            last_value: None,
            last_seen: Instant::now(),
            last_changed: Utc::now(),
            change_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitoringStatistics {
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_duration: Duration,
    /// Block reads that returned values
    pub successful_reads: u64,
    pub failed_reads: u64,
}

impl MonitoringStatistics {
    pub fn total_cycles(&self) -> u64 {
        self.successful_cycles + self.failed_cycles
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_cycles();
        if total == 0 {
            return 0.0;
        }
        self.successful_cycles as f64 / total as f64 * 100.0
    }
}

/// Contiguous block read of monitored devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub code: DeviceCode,
    pub start: u32,
    pub count: usize,
}

/// Greedy contiguous grouping of sorted addresses, each block at most `cap` long
pub fn contiguous_blocks(addresses: &[DeviceAddress], cap: usize) -> Vec<ReadBlock> {
    let cap = cap.max(1);
    let mut blocks: Vec<ReadBlock> = Vec::new();
    for addr in addresses {
        match blocks.last_mut() {
            Some(block)
                if block.code == addr.code
                    && block.count < cap
                    && u64::from(block.start) + block.count as u64 == u64::from(addr.address) =>
            {
                block.count += 1;
            },
            _ => blocks.push(ReadBlock {
                code: addr.code,
                start: addr.address,
                count: 1,
            }),
        }
    }
    blocks
}

// ============================================================================
// Interval ticker
// ============================================================================

/// Waits between cycles; injectable so cycle timing can be driven by tests
#[async_trait]
pub trait Ticker: Send + Sync {
    async fn wait(&self, delay: Duration);
}

/// Ticker backed by `tokio::time::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepTicker;

#[async_trait]
impl Ticker for SleepTicker {
    async fn wait(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

// ============================================================================
// Monitor
// ============================================================================

struct MonitorCore {
    channel: Arc<dyn ProtocolChannel>,
    continuity: Arc<ErrorContinuityPolicy>,
    sink: Arc<dyn EventSink>,
    settings: MonitorSettings,
    devices: DashMap<DeviceAddress, MonitoredDevice>,
    stats: Mutex<MonitoringStatistics>,
    cycle: AtomicU64,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AdaptiveMonitor {
    core: Arc<MonitorCore>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<LoopHandle>>,
}

impl AdaptiveMonitor {
    pub fn new(
        channel: Arc<dyn ProtocolChannel>,
        continuity: Arc<ErrorContinuityPolicy>,
        sink: Arc<dyn EventSink>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                channel,
                continuity,
                sink,
                settings,
                devices: DashMap::new(),
                stats: Mutex::new(MonitoringStatistics::default()),
                cycle: AtomicU64::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.core.settings
    }

    /// Add devices that are not monitored yet; existing state is kept
    pub fn register_devices<I>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = DeviceAddress>,
    {
        let mut added = 0;
        for address in addresses {
            self.core.devices.entry(address).or_insert_with(|| {
                added += 1;
                MonitoredDevice::new(address)
            });
        }
        debug!(
            "Registered {} new device(s), {} monitored",
            added,
            self.core.devices.len()
        );
        added
    }

    /// Start the background loop with the real-time ticker
    pub fn start_monitoring(&self) -> PlcResult<()> {
        self.start_with_ticker(Arc::new(SleepTicker))
    }

    /// Start the background loop; fails if one is already running
    pub fn start_with_ticker(&self, ticker: Arc<dyn Ticker>) -> PlcResult<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.running.swap(true, Ordering::SeqCst) {
            return Err(PlcError::State("monitoring is already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.running);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            core.run_loop(ticker, token).await;
            running.store(false, Ordering::SeqCst);
        });

        info!(
            "Monitoring started: {} device(s), interval {}ms",
            self.core.devices.len(),
            self.core.settings.interval.as_millis()
        );
        *handle = Some(LoopHandle { cancel, task });
        Ok(())
    }

    /// Signal the loop to stop and wait for it to finish
    pub async fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        let Some(LoopHandle { cancel, task }) = handle else {
            return;
        };
        cancel.cancel();
        match task.await {
            Ok(()) => info!("Monitoring stopped"),
            Err(e) if e.is_cancelled() => debug!("Monitoring task cancelled"),
            Err(e) => error!("Monitoring task failed: {}", e),
        }
    }

    /// Run one cycle on the caller's task
    pub async fn run_cycle(&self) -> MonitoringCycleResult {
        self.core.run_cycle().await
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn monitored_count(&self) -> usize {
        self.core.devices.len()
    }

    /// Devices refreshed within the inactivity window
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        let timeout = self.core.settings.inactive_device_timeout;
        self.core
            .devices
            .iter()
            .filter(|d| now.saturating_duration_since(d.last_seen) <= timeout)
            .count()
    }

    pub fn snapshot(&self, address: &DeviceAddress) -> Option<MonitoredDevice> {
        self.core.devices.get(address).map(|d| d.value().clone())
    }

    /// All monitored devices, ascending by address
    pub fn devices(&self) -> Vec<MonitoredDevice> {
        let mut all: Vec<MonitoredDevice> =
            self.core.devices.iter().map(|d| d.value().clone()).collect();
        all.sort_by_key(|d| d.address);
        all
    }

    pub fn statistics(&self) -> MonitoringStatistics {
        self.core.stats.lock().clone()
    }

    /// Candidates the next cycle would poll
    pub fn select_candidates(&self) -> Vec<DeviceAddress> {
        self.core.select_candidates()
    }
}

impl Drop for AdaptiveMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

impl MonitorCore {
    async fn run_loop(&self, ticker: Arc<dyn Ticker>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            let result = self.run_cycle().await;
            if let Some(e) = &result.error_message {
                warn!("Monitoring cycle {} failed: {}", result.cycle, e);
            }

            let delay = self.settings.interval.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.wait(delay) => {},
            }
        }
        debug!("Monitoring loop exited");
    }

    fn select_candidates(&self) -> Vec<DeviceAddress> {
        let now = Instant::now();
        let timeout = self.settings.inactive_device_timeout;
        let mut fresh: Vec<(DeviceAddress, u64)> = self
            .devices
            .iter()
            .filter(|d| now.saturating_duration_since(d.last_seen) <= timeout)
            .map(|d| (d.address, d.change_count))
            .collect();
        fresh.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        fresh.truncate(self.settings.candidate_cap());
        fresh.into_iter().map(|(address, _)| address).collect()
    }

    async fn run_cycle(&self) -> MonitoringCycleResult {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let start_time = Utc::now();
        let started = Instant::now();

        let candidates = self.select_candidates();
        emit_quietly(
            self.sink.as_ref(),
            DiscoveryEvent::CycleStart {
                cycle,
                candidates: candidates.len(),
            },
        )
        .await;

        let (mut bits, mut words): (Vec<DeviceAddress>, Vec<DeviceAddress>) = candidates
            .into_iter()
            .partition(|a| a.kind() == DeviceKind::Bit);
        bits.sort_unstable();
        words.sort_unstable();

        let cap = |kind| self.settings.max_batch_size.clamp(1, protocol_max(kind));
        let bit_blocks = contiguous_blocks(&bits, cap(DeviceKind::Bit));
        let word_blocks = contiguous_blocks(&words, cap(DeviceKind::Word));

        let (bit_reads, word_reads) =
            tokio::join!(self.read_group(&bit_blocks), self.read_group(&word_blocks));

        let total_blocks = bit_blocks.len() + word_blocks.len();
        let failed_blocks = bit_reads.1 + word_reads.1;
        let mut values_read = bit_reads.0;
        values_read.extend(word_reads.0);

        let changed_count = self.apply(&values_read);
        let duration = started.elapsed();

        let error_message = (total_blocks > 0 && failed_blocks == total_blocks)
            .then(|| format!("all {} block read(s) failed", total_blocks));
        {
            let mut stats = self.stats.lock();
            stats.successful_reads += (total_blocks - failed_blocks) as u64;
            stats.failed_reads += failed_blocks as u64;
            stats.last_cycle_duration = duration;
            if error_message.is_none() {
                stats.successful_cycles += 1;
            } else {
                stats.failed_cycles += 1;
            }
        }

        debug!(
            "Cycle {}: {} value(s), {} changed, {}/{} block(s) failed, {}ms",
            cycle,
            values_read.len(),
            changed_count,
            failed_blocks,
            total_blocks,
            duration.as_millis()
        );

        MonitoringCycleResult {
            cycle,
            start_time,
            end_time: Utc::now(),
            values_read,
            changed_count,
            error_message,
        }
    }

    /// Read the blocks of one kind in order; returns values and failed block count
    async fn read_group(&self, blocks: &[ReadBlock]) -> (Vec<DeviceValue>, usize) {
        let mut values = Vec::new();
        let mut failed = 0;
        for block in blocks {
            match self.read_block(block).await {
                Ok(read) => {
                    let timestamp = Utc::now();
                    values.extend(read.into_iter().enumerate().map(|(i, value)| {
                        DeviceValue::new(
                            DeviceAddress::new(block.code, block.start + i as u32),
                            value,
                            timestamp,
                        )
                    }));
                },
                Err(fault) => {
                    failed += 1;
                    warn!(
                        "Monitor read {}{} x{} failed: {}",
                        block.code, block.start, block.count, fault
                    );
                },
            }
        }
        (values, failed)
    }

    async fn read_block(&self, block: &ReadBlock) -> Result<Vec<Value>, CommunicationFault> {
        let channel = self.channel.as_ref();
        match block.code.kind() {
            DeviceKind::Bit => Ok(self
                .continuity
                .read_bits(channel, block.code, block.start, block.count)
                .await?
                .into_iter()
                .map(Value::Bit)
                .collect()),
            DeviceKind::Word => Ok(self
                .continuity
                .read_words(channel, block.code, block.start, block.count)
                .await?
                .into_iter()
                .map(Value::Word)
                .collect()),
        }
    }

    /// Diff new values against stored ones; returns how many changed
    fn apply(&self, values: &[DeviceValue]) -> usize {
        let now = Instant::now();
        let mut changed = 0;
        for read in values {
            let Some(mut device) = self.devices.get_mut(&read.address) else {
                continue;
            };
            device.last_seen = now;
            if device.last_value != Some(read.value) {
                device.last_value = Some(read.value);
                device.last_changed = read.timestamp;
                device.change_count += 1;
                changed += 1;
            }
        }
        changed
    }
}
