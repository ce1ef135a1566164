//! Range scanner
//!
//! Exhaustively reads one or more (device code, range) pairs in protocol-legal
//! batches and classifies every address as active or idle.
//!
//! Batches of one device code are issued sequentially; scans of different
//! device codes run concurrently, bounded by a semaphore held for the whole
//! range scan. A faulted batch is counted and skipped, never fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use errors::{validation_error, CommunicationFault, PlcError, PlcResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::DeviceCapabilities;
use super::channel::{protocol_max, ProtocolChannel};
use super::continuity::ErrorContinuityPolicy;
use super::types::{
    AddressRange, DeviceAddress, DeviceCode, DeviceKind, DeviceValue, ScanResult, ScanStatistics,
    Value,
};

/// Word value at or above which `AboveThreshold` marks an address active
pub const WORD_ACTIVITY_THRESHOLD: u16 = 1000;

// ============================================================================
// Liveness thresholds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitThreshold {
    /// Any set bit is active
    #[default]
    AnyTrue,
    /// Set bits are active only when the whole batch is set
    AllTrue,
    /// Set bits are active only when more than half the batch is set
    MajorityTrue,
}

impl BitThreshold {
    pub fn classify(self, bits: &[bool]) -> Vec<bool> {
        let gate = match self {
            BitThreshold::AnyTrue => true,
            BitThreshold::AllTrue => bits.iter().all(|b| *b),
            BitThreshold::MajorityTrue => bits.iter().filter(|b| **b).count() > bits.len() / 2,
        };
        bits.iter().map(|b| gate && *b).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordThreshold {
    #[default]
    NonZero,
    /// Value >= `WORD_ACTIVITY_THRESHOLD`
    AboveThreshold,
    /// Evaluated as non-zero; a scan has no previous poll to compare with
    HasChanged,
}

impl WordThreshold {
    pub fn classify(self, words: &[u16]) -> Vec<bool> {
        words
            .iter()
            .map(|w| match self {
                WordThreshold::NonZero | WordThreshold::HasChanged => *w != 0,
                WordThreshold::AboveThreshold => *w >= WORD_ACTIVITY_THRESHOLD,
            })
            .collect()
    }
}

// ============================================================================
// Batch planning
// ============================================================================

/// One contiguous block read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub start: u32,
    pub count: usize,
}

impl Batch {
    pub fn end(&self) -> u32 {
        self.start + self.count as u32 - 1
    }
}

/// Split `range` into consecutive batches of `min(batch_size, protocol max)`
///
/// The batches are gap-free, non-overlapping and cover the range exactly.
/// `batch_size` must be at least 1.
pub fn plan_batches(range: &AddressRange, batch_size: usize, kind: DeviceKind) -> Vec<Batch> {
    let size = batch_size.clamp(1, protocol_max(kind)) as u64;
    let end = u64::from(range.end);
    let mut batches = Vec::with_capacity((u64::from(range.count()) / size + 1) as usize);
    let mut start = u64::from(range.start);
    while start <= end {
        let count = size.min(end - start + 1);
        batches.push(Batch {
            start: start as u32,
            count: count as usize,
        });
        start += count;
    }
    batches
}

// ============================================================================
// Scanner
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub bit_threshold: BitThreshold,
    pub word_threshold: WordThreshold,
    pub max_concurrent_scans: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            bit_threshold: BitThreshold::AnyTrue,
            word_threshold: WordThreshold::NonZero,
            max_concurrent_scans: 4,
        }
    }
}

/// One (device code, range) pair to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub code: DeviceCode,
    pub range: AddressRange,
}

pub struct RangeScanner {
    channel: Arc<dyn ProtocolChannel>,
    continuity: Arc<ErrorContinuityPolicy>,
    config: ScannerConfig,
    semaphore: Arc<Semaphore>,
    legal_ranges: HashMap<DeviceCode, AddressRange>,
    has_changed_warned: AtomicBool,
}

impl RangeScanner {
    pub fn new(
        channel: Arc<dyn ProtocolChannel>,
        continuity: Arc<ErrorContinuityPolicy>,
        config: ScannerConfig,
    ) -> Self {
        let permits = config.max_concurrent_scans.max(1);
        Self {
            channel,
            continuity,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            legal_ranges: HashMap::new(),
            has_changed_warned: AtomicBool::new(false),
        }
    }

    /// Restrict scans to the device codes and ranges the target supports
    pub fn with_legal_ranges(mut self, capabilities: &DeviceCapabilities) -> Self {
        self.legal_ranges = capabilities
            .ranges
            .iter()
            .map(|d| (d.code, d.range))
            .collect();
        self
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Reject a request before any I/O is issued
    pub fn validate_request(
        &self,
        code: DeviceCode,
        range: &AddressRange,
        batch_size: usize,
    ) -> PlcResult<()> {
        range.validate()?;
        if batch_size == 0 {
            return Err(validation_error!("batch size must be at least 1"));
        }
        if self.legal_ranges.is_empty() {
            return Ok(());
        }
        match self.legal_ranges.get(&code) {
            Some(legal) if legal.covers(range) => Ok(()),
            Some(legal) => Err(validation_error!(
                "{} range {} outside legal span {}",
                code,
                range,
                legal
            )),
            None => Err(validation_error!("{} is not supported by the target", code)),
        }
    }

    /// Scan one range; errors are only `Validation` or `Cancelled`
    pub async fn scan_range(
        &self,
        code: DeviceCode,
        range: AddressRange,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> PlcResult<ScanResult> {
        self.validate_request(code, &range, batch_size)?;
        if cancel.is_cancelled() {
            return Err(PlcError::Cancelled);
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PlcError::Cancelled),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| PlcError::State("scan semaphore closed".to_string()))?,
        };

        if code.is_word()
            && self.config.word_threshold == WordThreshold::HasChanged
            && !self.has_changed_warned.swap(true, Ordering::Relaxed)
        {
            warn!("Word threshold has_changed is evaluated as non-zero during scans");
        }

        let batches = plan_batches(&range, batch_size, code.kind());
        debug!(
            "Scan {} {} in {} batch(es) of <= {}",
            code,
            range,
            batches.len(),
            batch_size.min(protocol_max(code.kind()))
        );

        let mut result = ScanResult::empty(code, range);
        result.all_values.reserve(range.count() as usize);
        let scan_started = Instant::now();

        for batch in batches {
            if cancel.is_cancelled() {
                debug!("Scan {} {} cancelled at {}", code, range, batch.start);
                return Err(PlcError::Cancelled);
            }

            let batch_started = Instant::now();
            let outcome = self.read_batch(code, batch).await;
            result.statistics.total_time_ms += batch_started.elapsed().as_millis() as u64;

            match outcome {
                Ok((values, active)) => {
                    let timestamp = Utc::now();
                    for (offset, (value, is_active)) in values.into_iter().zip(active).enumerate() {
                        let address = DeviceAddress::new(code, batch.start + offset as u32);
                        if is_active {
                            result.active_addresses.push(address);
                        }
                        result
                            .all_values
                            .push(DeviceValue::new(address, value, timestamp));
                    }
                    result.statistics.successful_batches += 1;
                },
                Err(fault) => {
                    result.statistics.failed_batches += 1;
                    warn!(
                        "Batch {}{}-{} failed, skipping: {}",
                        code,
                        batch.start,
                        batch.end(),
                        fault
                    );
                },
            }
        }

        debug!(
            "Scan {} {} done: {} active / {} read, {} failed batch(es), {}ms",
            code,
            range,
            result.active_addresses.len(),
            result.all_values.len(),
            result.statistics.failed_batches,
            scan_started.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Scan every request concurrently and sort by descending range priority
    pub async fn scan_devices(
        &self,
        requests: &[ScanRequest],
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> PlcResult<Vec<ScanResult>> {
        for request in requests {
            self.validate_request(request.code, &request.range, batch_size)?;
        }
        info!(
            "Scanning {} device range(s), batch {}, concurrency {}",
            requests.len(),
            batch_size,
            self.config.max_concurrent_scans
        );

        let scans = requests
            .iter()
            .map(|r| self.scan_range(r.code, r.range, batch_size, cancel));
        let outcomes = join_all(scans).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.push(outcome?);
        }
        // sort_by is stable: ties keep submission order
        results.sort_by(|a, b| b.range.priority.cmp(&a.range.priority));

        let stats = results.iter().fold(ScanStatistics::default(), |mut acc, r| {
            acc.merge(&r.statistics);
            acc
        });
        info!(
            "Scan finished: {} batch(es) ok, {} failed",
            stats.successful_batches, stats.failed_batches
        );
        Ok(results)
    }

    /// Single-point read straight on the channel; true if the target answered
    pub async fn probe(&self, code: DeviceCode, address: u32) -> bool {
        let outcome = match code.kind() {
            DeviceKind::Bit => self.channel.read_bits(code, address, 1).await.map(|_| ()),
            DeviceKind::Word => self.channel.read_words(code, address, 1).await.map(|_| ()),
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                debug!("Probe {} failed: {}", DeviceAddress::new(code, address), e);
                false
            },
        }
    }

    async fn read_batch(
        &self,
        code: DeviceCode,
        batch: Batch,
    ) -> Result<(Vec<Value>, Vec<bool>), CommunicationFault> {
        let channel = self.channel.as_ref();
        match code.kind() {
            DeviceKind::Bit => {
                let bits = self
                    .continuity
                    .read_bits(channel, code, batch.start, batch.count)
                    .await?;
                let active = self.config.bit_threshold.classify(&bits);
                Ok((bits.into_iter().map(Value::Bit).collect(), active))
            },
            DeviceKind::Word => {
                let words = self
                    .continuity
                    .read_words(channel, code, batch.start, batch.count)
                    .await?;
                let active = self.config.word_threshold.classify(&words);
                Ok((words.into_iter().map(Value::Word).collect(), active))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::catalog::{DeviceCapabilityCatalog, StaticCatalog};
    use crate::core::continuity::ContinuityMode;
    use crate::core::simulator::SimulatedChannel;
    use crate::core::types::TargetIdentity;
    use std::time::Duration;

    fn range(start: u32, end: u32, priority: u8) -> AddressRange {
        AddressRange::new(start, end, priority).unwrap()
    }

    async fn scanner_with(
        mode: ContinuityMode,
        concurrency: usize,
    ) -> (Arc<SimulatedChannel>, RangeScanner) {
        let sim = Arc::new(
            SimulatedChannel::new(TargetIdentity {
                display_name: "Q02CPU".to_string(),
                type_code: 0x41,
            })
            .with_latency(Duration::from_millis(5)),
        );
        sim.connect().await.unwrap();
        let scanner = RangeScanner::new(
            sim.clone(),
            Arc::new(ErrorContinuityPolicy::with_mode(mode)),
            ScannerConfig {
                max_concurrent_scans: concurrency,
                ..Default::default()
            },
        );
        (sim, scanner)
    }

    #[test]
    fn test_plan_batches_partitions_range() {
        let batches = plan_batches(&range(0, 99, 0), 32, DeviceKind::Bit);
        let spans: Vec<(u32, u32)> = batches.iter().map(|b| (b.start, b.end())).collect();
        assert_eq!(spans, vec![(0, 31), (32, 63), (64, 95), (96, 99)]);
        assert_eq!(batches.iter().map(|b| b.count).sum::<usize>(), 100);
    }

    #[test]
    fn test_plan_batches_caps_at_protocol_max() {
        let batches = plan_batches(&range(0, 1999, 0), 5000, DeviceKind::Word);
        assert!(batches.iter().all(|b| b.count <= 960));
        assert_eq!(batches.len(), 3);

        let batches = plan_batches(&range(0, 9999, 0), 10_000, DeviceKind::Bit);
        assert_eq!(batches[0].count, 7168);
        assert_eq!(batches[1].count, 10_000 - 7168);
    }

    #[test]
    fn test_plan_batches_is_gap_free_for_many_shapes() {
        for (start, end) in [(0u32, 0u32), (5, 5), (10, 73), (100, 1123), (0, 4095)] {
            for size in [1usize, 7, 32, 960, 7168] {
                for kind in [DeviceKind::Bit, DeviceKind::Word] {
                    let r = range(start, end, 0);
                    let batches = plan_batches(&r, size, kind);
                    let mut next = start;
                    for b in &batches {
                        assert_eq!(b.start, next);
                        assert!(b.count >= 1 && b.count <= size.min(protocol_max(kind)));
                        next = b.end() + 1;
                    }
                    assert_eq!(next, end + 1);
                }
            }
        }
    }

    #[test]
    fn test_plan_batches_at_address_ceiling() {
        let top = crate::core::types::MAX_DEVICE_ADDRESS;
        let batches = plan_batches(&range(top - 9, top, 0), 4, DeviceKind::Bit);
        assert_eq!(batches.last().unwrap().end(), top);
    }

    #[test]
    fn test_bit_thresholds() {
        let bits = [true, false, true, true];
        assert_eq!(BitThreshold::AnyTrue.classify(&bits), vec![true, false, true, true]);
        assert_eq!(BitThreshold::AllTrue.classify(&bits), vec![false; 4]);
        assert_eq!(
            BitThreshold::MajorityTrue.classify(&bits),
            vec![true, false, true, true]
        );
        assert_eq!(BitThreshold::MajorityTrue.classify(&[true, false]), vec![false, false]);
        assert_eq!(BitThreshold::AllTrue.classify(&[true, true]), vec![true, true]);
    }

    #[test]
    fn test_word_thresholds() {
        let words = [0, 7, 1000, 999];
        assert_eq!(
            WordThreshold::NonZero.classify(&words),
            vec![false, true, true, true]
        );
        assert_eq!(
            WordThreshold::AboveThreshold.classify(&words),
            vec![false, false, true, false]
        );
        assert_eq!(
            WordThreshold::HasChanged.classify(&words),
            WordThreshold::NonZero.classify(&words)
        );
    }

    #[tokio::test]
    async fn test_scan_range_records_every_value() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 4).await;
        sim.set_bit(DeviceCode::M, 5, true);
        sim.set_bit(DeviceCode::M, 90, true);

        let result = scanner
            .scan_range(DeviceCode::M, range(0, 99, 3), 32, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.all_values.len(), 100);
        assert_eq!(
            result.active_addresses,
            vec![
                DeviceAddress::new(DeviceCode::M, 5),
                DeviceAddress::new(DeviceCode::M, 90)
            ]
        );
        assert_eq!(result.statistics.successful_batches, 4);
        assert_eq!(result.active_values().count(), 2);
        let calls: Vec<(u32, usize)> = sim.read_log().iter().map(|c| (c.address, c.count)).collect();
        assert_eq!(calls, vec![(0, 32), (32, 32), (64, 32), (96, 4)]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped_under_throw_mode() {
        let (sim, scanner) = scanner_with(ContinuityMode::ThrowException, 4).await;
        sim.inject_fault(DeviceCode::M, 40);
        sim.set_bit(DeviceCode::M, 70, true);

        let result = scanner
            .scan_range(DeviceCode::M, range(0, 99, 3), 32, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.statistics.failed_batches, 1);
        assert_eq!(result.statistics.successful_batches, 3);
        assert_eq!(result.all_values.len(), 68);
        assert!(result
            .all_values
            .iter()
            .all(|v| !(32..=63).contains(&v.address.address)));
        assert!(result.is_active(&DeviceAddress::new(DeviceCode::M, 70)));
    }

    #[tokio::test]
    async fn test_default_mode_substitutes_and_counts_success() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 4).await;
        sim.inject_fault(DeviceCode::D, 0);
        let result = scanner
            .scan_range(DeviceCode::D, range(0, 9, 3), 32, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.statistics.failed_batches, 0);
        assert_eq!(result.all_values.len(), 10);
        assert!(result.active_addresses.is_empty());
    }

    #[tokio::test]
    async fn test_validation_fails_before_io() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 4).await;
        let caps = StaticCatalog::default().get_supported_devices(0x41);
        let scanner = scanner.with_legal_ranges(&caps);

        let err = scanner
            .scan_range(DeviceCode::M, range(0, 9000, 3), 32, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));

        let err = scanner
            .scan_range(DeviceCode::Zr, range(0, 10, 1), 32, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlcError::Validation(_)));

        let bad = AddressRange {
            start: 10,
            end: 5,
            priority: 0,
        };
        assert!(scanner
            .scan_range(DeviceCode::M, bad, 32, &CancellationToken::new())
            .await
            .is_err());
        assert!(scanner
            .scan_range(DeviceCode::M, range(0, 9, 0), 0, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(sim.read_call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_scan_starts_no_batches() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scanner
            .scan_range(DeviceCode::M, range(0, 99, 0), 32, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(sim.read_call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_scan_finishes_in_flight_batch_only() {
        let sim = Arc::new(
            SimulatedChannel::new(TargetIdentity {
                display_name: "Q02CPU".to_string(),
                type_code: 0x41,
            })
            .with_latency(Duration::from_millis(50)),
        );
        sim.connect().await.unwrap();
        let scanner = RangeScanner::new(
            sim.clone(),
            Arc::new(ErrorContinuityPolicy::with_mode(
                ContinuityMode::ReturnDefaultAndContinue,
            )),
            ScannerConfig::default(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            trigger.cancel();
        });

        let err = scanner
            .scan_range(DeviceCode::M, range(0, 99, 0), 32, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        // batch 0-31 done, batch 32-63 was in flight at 70ms and completed
        let spans: Vec<(u32, u32)> = sim.read_log().iter().map(|c| (c.address, c.end())).collect();
        assert_eq!(spans, vec![(0, 31), (32, 63)]);
        assert_eq!(sim.read_call_count(), 2);
    }

    #[tokio::test]
    async fn test_scan_devices_sorts_by_priority_and_bounds_concurrency() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 2).await;
        let requests = [
            ScanRequest {
                code: DeviceCode::X,
                range: range(0, 63, 2),
            },
            ScanRequest {
                code: DeviceCode::M,
                range: range(0, 63, 3),
            },
            ScanRequest {
                code: DeviceCode::B,
                range: range(0, 63, 1),
            },
            ScanRequest {
                code: DeviceCode::Y,
                range: range(0, 63, 2),
            },
        ];
        let results = scanner
            .scan_devices(&requests, 16, &CancellationToken::new())
            .await
            .unwrap();
        let order: Vec<DeviceCode> = results.iter().map(|r| r.device_code).collect();
        assert_eq!(
            order,
            vec![DeviceCode::M, DeviceCode::X, DeviceCode::Y, DeviceCode::B]
        );
        assert!(sim.peak_concurrency() <= 2);
        assert!(sim.peak_concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_probe() {
        let (sim, scanner) = scanner_with(ContinuityMode::ReturnDefaultAndContinue, 1).await;
        assert!(scanner.probe(DeviceCode::M, 0).await);
        sim.inject_fault(DeviceCode::M, 0);
        assert!(!scanner.probe(DeviceCode::M, 0).await);
        assert!(scanner.probe(DeviceCode::D, 0).await);
    }
}
