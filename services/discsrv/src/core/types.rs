//! Device memory types
//!
//! Device codes, addresses, values and the result records produced by the
//! range scanner and the adaptive monitor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{validation_error, PlcError, PlcResult};
use serde::{Deserialize, Serialize};

/// Highest address encodable in a 3-byte device address field
pub const MAX_DEVICE_ADDRESS: u32 = 0x00FF_FFFF;

// ============================================================================
// Device Code
// ============================================================================

/// Whether a device holds single bits or 16-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Bit,
    Word,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Bit => write!(f, "BIT"),
            DeviceKind::Word => write!(f, "WORD"),
        }
    }
}

/// Memory region class inside the controller, with its protocol code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum DeviceCode {
    /// Special relay
    Sm = 0x91,
    /// Special register
    Sd = 0xA9,
    /// Input
    X = 0x9C,
    /// Output
    Y = 0x9D,
    /// Internal relay
    M = 0x90,
    /// Latch relay
    L = 0x92,
    /// Annunciator
    F = 0x93,
    /// Edge relay
    V = 0x94,
    /// Link relay
    B = 0xA0,
    /// Data register
    D = 0xA8,
    /// Link register
    W = 0xB4,
    /// Timer contact
    Ts = 0xC1,
    /// Timer coil
    Tc = 0xC0,
    /// Timer current value
    Tn = 0xC2,
    /// Retentive timer contact
    Ss = 0xC7,
    /// Retentive timer coil
    Sc = 0xC6,
    /// Retentive timer current value
    Sn = 0xC8,
    /// Counter contact
    Cs = 0xC4,
    /// Counter coil
    Cc = 0xC3,
    /// Counter current value
    Cn = 0xC5,
    /// Link special relay
    Sb = 0xA1,
    /// Link special register
    Sw = 0xB5,
    /// Direct input
    Dx = 0xA2,
    /// Direct output
    Dy = 0xA3,
    /// Index register
    Z = 0xCC,
    /// File register (block switching)
    R = 0xAF,
    /// File register (serial number access)
    Zr = 0xB0,
}

impl DeviceCode {
    pub const ALL: [DeviceCode; 27] = [
        DeviceCode::Sm,
        DeviceCode::Sd,
        DeviceCode::X,
        DeviceCode::Y,
        DeviceCode::M,
        DeviceCode::L,
        DeviceCode::F,
        DeviceCode::V,
        DeviceCode::B,
        DeviceCode::D,
        DeviceCode::W,
        DeviceCode::Ts,
        DeviceCode::Tc,
        DeviceCode::Tn,
        DeviceCode::Ss,
        DeviceCode::Sc,
        DeviceCode::Sn,
        DeviceCode::Cs,
        DeviceCode::Cc,
        DeviceCode::Cn,
        DeviceCode::Sb,
        DeviceCode::Sw,
        DeviceCode::Dx,
        DeviceCode::Dy,
        DeviceCode::Z,
        DeviceCode::R,
        DeviceCode::Zr,
    ];

    /// Protocol byte for this device
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.code() == code)
    }

    pub fn kind(self) -> DeviceKind {
        match self {
            DeviceCode::D
            | DeviceCode::W
            | DeviceCode::R
            | DeviceCode::Zr
            | DeviceCode::Tn
            | DeviceCode::Sn
            | DeviceCode::Cn
            | DeviceCode::Sw
            | DeviceCode::Sd
            | DeviceCode::Z => DeviceKind::Word,
            _ => DeviceKind::Bit,
        }
    }

    pub fn is_bit(self) -> bool {
        self.kind() == DeviceKind::Bit
    }

    pub fn is_word(self) -> bool {
        self.kind() == DeviceKind::Word
    }

    /// Addresses of these devices are written in hexadecimal (X1F, not X31)
    pub fn is_hex_address(self) -> bool {
        matches!(
            self,
            DeviceCode::X
                | DeviceCode::Y
                | DeviceCode::B
                | DeviceCode::W
                | DeviceCode::Sb
                | DeviceCode::Sw
                | DeviceCode::Dx
                | DeviceCode::Dy
                | DeviceCode::Zr
        )
    }

    /// Mnemonic used in addresses and configuration ("M", "ZR", ...)
    pub fn name(self) -> &'static str {
        match self {
            DeviceCode::Sm => "SM",
            DeviceCode::Sd => "SD",
            DeviceCode::X => "X",
            DeviceCode::Y => "Y",
            DeviceCode::M => "M",
            DeviceCode::L => "L",
            DeviceCode::F => "F",
            DeviceCode::V => "V",
            DeviceCode::B => "B",
            DeviceCode::D => "D",
            DeviceCode::W => "W",
            DeviceCode::Ts => "TS",
            DeviceCode::Tc => "TC",
            DeviceCode::Tn => "TN",
            DeviceCode::Ss => "SS",
            DeviceCode::Sc => "SC",
            DeviceCode::Sn => "SN",
            DeviceCode::Cs => "CS",
            DeviceCode::Cc => "CC",
            DeviceCode::Cn => "CN",
            DeviceCode::Sb => "SB",
            DeviceCode::Sw => "SW",
            DeviceCode::Dx => "DX",
            DeviceCode::Dy => "DY",
            DeviceCode::Z => "Z",
            DeviceCode::R => "R",
            DeviceCode::Zr => "ZR",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            DeviceCode::Sm => "special relay",
            DeviceCode::Sd => "special register",
            DeviceCode::X => "input",
            DeviceCode::Y => "output",
            DeviceCode::M => "internal relay",
            DeviceCode::L => "latch relay",
            DeviceCode::F => "annunciator",
            DeviceCode::V => "edge relay",
            DeviceCode::B => "link relay",
            DeviceCode::D => "data register",
            DeviceCode::W => "link register",
            DeviceCode::Ts => "timer contact",
            DeviceCode::Tc => "timer coil",
            DeviceCode::Tn => "timer current value",
            DeviceCode::Ss => "retentive timer contact",
            DeviceCode::Sc => "retentive timer coil",
            DeviceCode::Sn => "retentive timer current value",
            DeviceCode::Cs => "counter contact",
            DeviceCode::Cc => "counter coil",
            DeviceCode::Cn => "counter current value",
            DeviceCode::Sb => "link special relay",
            DeviceCode::Sw => "link special register",
            DeviceCode::Dx => "direct input",
            DeviceCode::Dy => "direct output",
            DeviceCode::Z => "index register",
            DeviceCode::R => "file register",
            DeviceCode::Zr => "file register (serial)",
        }
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceCode {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| validation_error!("Unknown device code: {}", s))
    }
}

// ============================================================================
// Addresses and Values
// ============================================================================

/// Identity key of one device point, hashed directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub code: DeviceCode,
    pub address: u32,
}

impl DeviceAddress {
    pub fn new(code: DeviceCode, address: u32) -> Self {
        Self { code, address }
    }

    pub fn kind(&self) -> DeviceKind {
        self.code.kind()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_hex_address() {
            write!(f, "{}{:X}", self.code, self.address)
        } else {
            write!(f, "{}{}", self.code, self.address)
        }
    }
}

/// Value read from a device point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Bit(bool),
    Word(u16),
}

impl Value {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Value::Bit(_) => DeviceKind::Bit,
            Value::Word(_) => DeviceKind::Word,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bit(b) => write!(f, "{}", u8::from(*b)),
            Value::Word(w) => write!(f, "{}", w),
        }
    }
}

/// Immutable snapshot of one point at one moment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceValue {
    pub address: DeviceAddress,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

impl DeviceValue {
    pub fn new(address: DeviceAddress, value: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            address,
            value,
            timestamp,
        }
    }
}

// ============================================================================
// Ranges
// ============================================================================

/// Inclusive address range with a scan priority (higher first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub priority: u8,
}

impl AddressRange {
    pub fn new(start: u32, end: u32, priority: u8) -> PlcResult<Self> {
        let range = Self {
            start,
            end,
            priority,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> PlcResult<()> {
        if self.start > self.end {
            return Err(validation_error!(
                "Address range start {} is after end {}",
                self.start,
                self.end
            ));
        }
        if self.end > MAX_DEVICE_ADDRESS {
            return Err(validation_error!(
                "Address {} exceeds the addressable maximum {}",
                self.end,
                MAX_DEVICE_ADDRESS
            ));
        }
        Ok(())
    }

    /// Number of addresses in the range (`end - start + 1`)
    pub fn count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    /// Whether `other` lies completely inside this range
    pub fn covers(&self, other: &AddressRange) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ============================================================================
// Scan Results
// ============================================================================

/// Batch counters and timing of one range scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatistics {
    pub successful_batches: u32,
    pub failed_batches: u32,
    pub total_time_ms: u64,
}

impl ScanStatistics {
    pub fn total_batches(&self) -> u32 {
        self.successful_batches + self.failed_batches
    }

    /// Percentage of batches that were read successfully
    pub fn success_rate(&self) -> f64 {
        let total = self.total_batches();
        if total == 0 {
            return 0.0;
        }
        f64::from(self.successful_batches) / f64::from(total) * 100.0
    }

    pub fn average_response_ms(&self) -> f64 {
        let total = self.total_batches();
        if total == 0 {
            return 0.0;
        }
        self.total_time_ms as f64 / f64::from(total)
    }

    pub fn merge(&mut self, other: &ScanStatistics) {
        self.successful_batches += other.successful_batches;
        self.failed_batches += other.failed_batches;
        self.total_time_ms += other.total_time_ms;
    }
}

/// Outcome of scanning one (device code, range) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub device_code: DeviceCode,
    pub range: AddressRange,
    /// Addresses whose value met the liveness threshold, ascending
    pub active_addresses: Vec<DeviceAddress>,
    /// Every value read, active or not, ascending by address
    pub all_values: Vec<DeviceValue>,
    pub statistics: ScanStatistics,
}

impl ScanResult {
    pub fn empty(device_code: DeviceCode, range: AddressRange) -> Self {
        Self {
            device_code,
            range,
            active_addresses: Vec::new(),
            all_values: Vec::new(),
            statistics: ScanStatistics::default(),
        }
    }

    pub fn is_active(&self, address: &DeviceAddress) -> bool {
        self.active_addresses.binary_search(address).is_ok()
    }

    /// Values of the addresses flagged active
    pub fn active_values(&self) -> impl Iterator<Item = &DeviceValue> + '_ {
        self.all_values
            .iter()
            .filter(move |v| self.is_active(&v.address))
    }
}

/// Target identity reported by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub display_name: String,
    pub type_code: u16,
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.display_name, self.type_code)
    }
}

/// Aggregate of one discovery run's scans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub target: TargetIdentity,
    pub scan_results: Vec<ScanResult>,
    pub total_duration: Duration,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
}

impl DiscoveryResult {
    pub fn total_active_devices(&self) -> usize {
        self.scan_results
            .iter()
            .map(|r| r.active_addresses.len())
            .sum()
    }

    pub fn total_scanned_addresses(&self) -> usize {
        self.scan_results.iter().map(|r| r.all_values.len()).sum()
    }

    pub fn overall_statistics(&self) -> ScanStatistics {
        let mut total = ScanStatistics::default();
        for result in &self.scan_results {
            total.merge(&result.statistics);
        }
        total
    }
}

/// Outcome of one monitoring cycle
#[derive(Debug, Clone)]
pub struct MonitoringCycleResult {
    pub cycle: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub values_read: Vec<DeviceValue>,
    pub changed_count: usize,
    pub error_message: Option<String>,
}

impl MonitoringCycleResult {
    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_device_code_round_trip_by_name_and_byte() {
        for code in DeviceCode::ALL {
            assert_eq!(code.name().parse::<DeviceCode>().unwrap(), code);
            assert_eq!(DeviceCode::from_code(code.code()), Some(code));
        }
        assert_eq!("zr".parse::<DeviceCode>().unwrap(), DeviceCode::Zr);
        assert!("QQ".parse::<DeviceCode>().is_err());
    }

    #[test]
    fn test_device_kinds() {
        assert!(DeviceCode::M.is_bit());
        assert!(DeviceCode::X.is_bit());
        assert!(DeviceCode::D.is_word());
        assert!(DeviceCode::Tn.is_word());
        assert!(DeviceCode::Ts.is_bit());
        assert_eq!(DeviceCode::D.code(), 0xA8);
        assert_eq!(DeviceCode::M.code(), 0x90);
    }

    #[test]
    fn test_address_display_uses_hex_notation() {
        assert_eq!(DeviceAddress::new(DeviceCode::X, 31).to_string(), "X1F");
        assert_eq!(DeviceAddress::new(DeviceCode::M, 100).to_string(), "M100");
        assert_eq!(DeviceAddress::new(DeviceCode::Zr, 255).to_string(), "ZRFF");
    }

    #[test]
    fn test_address_range_validation() {
        let range = AddressRange::new(0, 99, 3).unwrap();
        assert_eq!(range.count(), 100);
        assert!(range.contains(99));
        assert!(!range.contains(100));
        assert!(AddressRange::new(10, 5, 1).is_err());
        assert!(AddressRange::new(0, MAX_DEVICE_ADDRESS + 1, 1).is_err());
        let single = AddressRange::new(7, 7, 0).unwrap();
        assert_eq!(single.count(), 1);
    }

    #[test]
    fn test_scan_statistics_rates() {
        let stats = ScanStatistics {
            successful_batches: 3,
            failed_batches: 1,
            total_time_ms: 40,
        };
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert!((stats.average_response_ms() - 10.0).abs() < f64::EPSILON);
        assert_eq!(ScanStatistics::default().success_rate(), 0.0);
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&Value::Word(7)).unwrap();
        assert_eq!(json, r#"{"type":"word","value":7}"#);
    }
}
