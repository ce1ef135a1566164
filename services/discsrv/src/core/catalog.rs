//! Device capability catalog
//!
//! Immutable per-series tables: which device codes a controller family
//! supports, their legal address ranges, and batch/concurrency hints.
//! Tables are plain `const` data; lookups are pure functions.

use std::fmt;

use errors::{config_error, PlcResult};
use serde::{Deserialize, Serialize};

use super::channel::MAX_WORD_BATCH;
use super::types::{AddressRange, DeviceCode, DeviceKind};

/// Upper bound for configured scan concurrency
pub const MAX_CONCURRENCY: usize = 16;

/// Identity used when the controller cannot tell us what it is (Q00CPU)
pub const FALLBACK_TYPE_CODE: u16 = 0x0251;
pub const FALLBACK_DISPLAY_NAME: &str = "Unknown";

// ============================================================================
// Series detection
// ============================================================================

/// Controller family derived from the target type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlcSeries {
    Fx,
    Fx5,
    Q,
    QHighPerformance,
    L,
    Qs,
    IqR,
    Unknown,
}

impl PlcSeries {
    pub fn from_type_code(type_code: u16) -> Self {
        match type_code {
            0x01D0 | 0x01D1 | 0x01E0 | 0x01E1 => PlcSeries::Fx,
            0x01F0..=0x01F2 => PlcSeries::Fx5,
            0x0230 => PlcSeries::Qs,
            0x0042..=0x0044 | 0x004B | 0x004C => PlcSeries::QHighPerformance,
            0x0041 | 0x0250..=0x0252 | 0x0260..=0x026E | 0x0366..=0x036C => PlcSeries::Q,
            0x0541..=0x0545 | 0x0641 | 0x48C0..=0x48C2 => PlcSeries::L,
            0x4800..=0x48BF => PlcSeries::IqR,
            _ => PlcSeries::Unknown,
        }
    }

    /// Recommended (batch size, concurrency) for this family
    pub fn hints(self) -> (usize, usize) {
        match self {
            PlcSeries::Fx => (16, 2),
            PlcSeries::Fx5 => (32, 3),
            PlcSeries::Q => (64, 4),
            PlcSeries::QHighPerformance => (96, 6),
            PlcSeries::IqR => (96, 8),
            PlcSeries::L => (32, 3),
            PlcSeries::Qs => (16, 2),
            PlcSeries::Unknown => (32, 4),
        }
    }

    /// Device table for this family: (code, start, end, priority, extended)
    fn table(self) -> &'static [DeviceEntry] {
        match self {
            PlcSeries::Fx => FX_DEVICES,
            PlcSeries::Fx5 => FX5_DEVICES,
            PlcSeries::Q => Q_DEVICES,
            PlcSeries::QHighPerformance => Q_HP_DEVICES,
            PlcSeries::IqR => R_DEVICES,
            PlcSeries::L => L_DEVICES,
            PlcSeries::Qs => QS_DEVICES,
            PlcSeries::Unknown => DEFAULT_DEVICES,
        }
    }
}

impl fmt::Display for PlcSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlcSeries::Fx => write!(f, "FX"),
            PlcSeries::Fx5 => write!(f, "FX5"),
            PlcSeries::Q => write!(f, "Q"),
            PlcSeries::QHighPerformance => write!(f, "Q-HP"),
            PlcSeries::L => write!(f, "L"),
            PlcSeries::Qs => write!(f, "QS"),
            PlcSeries::IqR => write!(f, "iQ-R"),
            PlcSeries::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ============================================================================
// Static tables
// ============================================================================

struct DeviceEntry {
    code: DeviceCode,
    start: u32,
    end: u32,
    priority: u8,
    /// Only scanned in comprehensive mode
    extended: bool,
}

const fn core(code: DeviceCode, end: u32, priority: u8) -> DeviceEntry {
    DeviceEntry {
        code,
        start: 0,
        end,
        priority,
        extended: false,
    }
}

const fn ext(code: DeviceCode, end: u32, priority: u8) -> DeviceEntry {
    DeviceEntry {
        code,
        start: 0,
        end,
        priority,
        extended: true,
    }
}

const FX_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 7999, 3),
    core(DeviceCode::D, 7999, 3),
    core(DeviceCode::X, 0o177, 2),
    core(DeviceCode::Y, 0o177, 2),
    ext(DeviceCode::Sm, 255, 1),
    ext(DeviceCode::Sd, 255, 1),
    ext(DeviceCode::Ts, 255, 1),
    ext(DeviceCode::Tc, 255, 1),
    ext(DeviceCode::Tn, 255, 1),
    ext(DeviceCode::Cs, 255, 1),
    ext(DeviceCode::Cc, 255, 1),
    ext(DeviceCode::Cn, 255, 1),
];

const FX5_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 15999, 3),
    core(DeviceCode::D, 15999, 3),
    core(DeviceCode::X, 255, 2),
    core(DeviceCode::Y, 255, 2),
    ext(DeviceCode::L, 3999, 1),
    ext(DeviceCode::R, 32767, 1),
    ext(DeviceCode::Z, 15, 1),
    ext(DeviceCode::Sm, 255, 1),
    ext(DeviceCode::Sd, 255, 1),
    ext(DeviceCode::Tn, 255, 1),
    ext(DeviceCode::Cn, 255, 1),
];

const Q_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 8191, 3),
    core(DeviceCode::D, 12287, 3),
    core(DeviceCode::X, 2047, 2),
    core(DeviceCode::Y, 2047, 2),
    core(DeviceCode::W, 8191, 2),
    core(DeviceCode::B, 8191, 1),
    ext(DeviceCode::F, 2047, 1),
    ext(DeviceCode::V, 2047, 1),
    ext(DeviceCode::L, 8191, 1),
    ext(DeviceCode::Sm, 2047, 1),
    ext(DeviceCode::Sd, 2047, 1),
    ext(DeviceCode::Tn, 2047, 1),
    ext(DeviceCode::Cn, 1023, 1),
];

const Q_HP_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 8191, 3),
    core(DeviceCode::D, 12287, 3),
    core(DeviceCode::X, 8191, 2),
    core(DeviceCode::Y, 8191, 2),
    core(DeviceCode::W, 8191, 2),
    core(DeviceCode::B, 8191, 1),
    ext(DeviceCode::F, 2047, 1),
    ext(DeviceCode::V, 2047, 1),
    ext(DeviceCode::L, 8191, 1),
    ext(DeviceCode::Sm, 2047, 1),
    ext(DeviceCode::Sd, 2047, 1),
    ext(DeviceCode::Tn, 2047, 1),
    ext(DeviceCode::Cn, 1023, 1),
    ext(DeviceCode::R, 32767, 1),
];

const R_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 32767, 3),
    core(DeviceCode::D, 32767, 3),
    core(DeviceCode::X, 12287, 2),
    core(DeviceCode::Y, 12287, 2),
    core(DeviceCode::W, 32767, 2),
    core(DeviceCode::B, 32767, 1),
    ext(DeviceCode::F, 32767, 1),
    ext(DeviceCode::V, 32767, 1),
    ext(DeviceCode::L, 32767, 1),
    ext(DeviceCode::Sm, 4095, 1),
    ext(DeviceCode::Sd, 4095, 1),
    ext(DeviceCode::Tn, 4095, 1),
    ext(DeviceCode::Cn, 4095, 1),
    ext(DeviceCode::R, 32767, 1),
];

const L_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 8191, 3),
    core(DeviceCode::D, 32767, 3),
    core(DeviceCode::X, 4095, 2),
    core(DeviceCode::Y, 4095, 2),
    core(DeviceCode::W, 8191, 2),
    core(DeviceCode::B, 8191, 1),
    ext(DeviceCode::F, 2047, 1),
    ext(DeviceCode::L, 8191, 1),
    ext(DeviceCode::Sm, 2047, 1),
    ext(DeviceCode::Sd, 2047, 1),
    ext(DeviceCode::Tn, 2047, 1),
];

const QS_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 2047, 3),
    core(DeviceCode::D, 4095, 3),
    core(DeviceCode::X, 255, 2),
    core(DeviceCode::Y, 255, 2),
    ext(DeviceCode::Sm, 1023, 1),
    ext(DeviceCode::Sd, 1023, 1),
];

const DEFAULT_DEVICES: &[DeviceEntry] = &[
    core(DeviceCode::M, 1023, 3),
    core(DeviceCode::D, 1023, 3),
    core(DeviceCode::X, 255, 2),
    core(DeviceCode::Y, 255, 2),
];

// ============================================================================
// Catalog API
// ============================================================================

/// How much of the address space a discovery run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Core devices only (M, D, X, Y, W, B)
    Basic,
    /// Core plus series-specific extended devices
    #[default]
    Comprehensive,
}

impl DiscoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMode::Basic => "basic",
            DiscoveryMode::Comprehensive => "comprehensive",
        }
    }
}

/// One supported device code with its legal range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedDevice {
    pub code: DeviceCode,
    pub range: AddressRange,
}

/// Everything the catalog knows about one target type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub series: PlcSeries,
    pub bit_device_codes: Vec<DeviceCode>,
    pub word_device_codes: Vec<DeviceCode>,
    /// Devices in table order with their legal ranges
    pub ranges: Vec<SupportedDevice>,
    pub recommended_batch_size: usize,
    pub recommended_concurrency: usize,
}

impl DeviceCapabilities {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn range_for(&self, code: DeviceCode) -> Option<AddressRange> {
        self.ranges.iter().find(|d| d.code == code).map(|d| d.range)
    }
}

/// Source of per-target device capabilities
pub trait DeviceCapabilityCatalog: Send + Sync {
    fn get_supported_devices(&self, type_code: u16) -> DeviceCapabilities;
}

/// Catalog backed by the built-in series tables
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCatalog {
    mode: DiscoveryMode,
}

impl StaticCatalog {
    pub fn new(mode: DiscoveryMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    /// Check batch size and concurrency against protocol and catalog limits
    pub fn validate(batch_size: usize, concurrency: usize) -> PlcResult<()> {
        if batch_size == 0 || batch_size > MAX_WORD_BATCH {
            return Err(config_error!(
                "batch size {} outside 1..={}",
                batch_size,
                MAX_WORD_BATCH
            ));
        }
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(config_error!(
                "concurrency {} outside 1..={}",
                concurrency,
                MAX_CONCURRENCY
            ));
        }
        Ok(())
    }
}

impl DeviceCapabilityCatalog for StaticCatalog {
    fn get_supported_devices(&self, type_code: u16) -> DeviceCapabilities {
        let series = PlcSeries::from_type_code(type_code);
        let (batch, concurrency) = series.hints();

        let ranges: Vec<SupportedDevice> = series
            .table()
            .iter()
            .filter(|e| self.mode == DiscoveryMode::Comprehensive || !e.extended)
            .map(|e| SupportedDevice {
                code: e.code,
                range: AddressRange {
                    start: e.start,
                    end: e.end,
                    priority: e.priority,
                },
            })
            .collect();

        let codes_of = |kind: DeviceKind| -> Vec<DeviceCode> {
            ranges
                .iter()
                .filter(|d| d.code.kind() == kind)
                .map(|d| d.code)
                .collect()
        };

        DeviceCapabilities {
            series,
            bit_device_codes: codes_of(DeviceKind::Bit),
            word_device_codes: codes_of(DeviceKind::Word),
            ranges,
            recommended_batch_size: batch,
            recommended_concurrency: concurrency,
        }
    }
}
