//! Service configuration
//!
//! YAML file plus `DISCSRV_` environment overlay (nested keys separated by
//! `__`), extracted with figment. Every section has serde defaults so an
//! empty or missing file still yields a runnable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{config_error, PlcError, PlcResult};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::catalog::{DiscoveryMode, StaticCatalog};
use super::continuity::{ContinuityMode, ContinuitySettings};
use super::monitor::MonitorSettings;
use super::scanner::{BitThreshold, WordThreshold};
use super::types::DeviceCode;

pub const ENV_PREFIX: &str = "DISCSRV_";
pub const DEFAULT_CONFIG_PATH: &str = "config/discsrv.yaml";

// ============================================================================
// Sections
// ============================================================================

/// Connection parameters of the controller to discover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub display_name: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub receive_timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            display_name: "plc".to_string(),
            host: "127.0.0.1".to_string(),
            port: 5007,
            connect_timeout_ms: 10_000,
            receive_timeout_ms: 3_000,
        }
    }
}

impl TargetConfig {
    pub fn validate(&self) -> PlcResult<()> {
        if self.host.trim().is_empty() {
            return Err(config_error!("target host cannot be empty"));
        }
        if self.port == 0 {
            return Err(config_error!("target port cannot be 0"));
        }
        if self.connect_timeout_ms == 0 || self.receive_timeout_ms == 0 {
            return Err(config_error!("target timeouts must be at least 1ms"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    pub min_active_devices_for_monitoring: usize,
    pub bit_threshold: BitThreshold,
    pub word_threshold: WordThreshold,
    /// Overrides the catalog's recommended batch size
    pub batch_size: Option<usize>,
    /// Overrides the catalog's recommended concurrency
    pub max_concurrent_scans: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Comprehensive,
            min_active_devices_for_monitoring: 1,
            bit_threshold: BitThreshold::AnyTrue,
            word_threshold: WordThreshold::NonZero,
            batch_size: None,
            max_concurrent_scans: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_ms: u64,
    pub max_batch_size: usize,
    pub max_concurrent_operations: usize,
    pub inactive_device_timeout_secs: u64,
    pub status_report_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_batch_size: 32,
            max_concurrent_operations: 4,
            inactive_device_timeout_secs: 300,
            status_report_interval_secs: 30,
        }
    }
}

impl MonitoringConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(self.interval_ms),
            max_batch_size: self.max_batch_size,
            max_concurrent_operations: self.max_concurrent_operations,
            inactive_device_timeout: Duration::from_secs(self.inactive_device_timeout_secs),
        }
    }

    pub fn status_report_interval(&self) -> Duration {
        Duration::from_secs(self.status_report_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    pub mode: ContinuityMode,
    pub default_bit_value: bool,
    pub default_word_value: u16,
    pub notification_interval_secs: u64,
    pub error_rate_warning_percent: f64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            mode: ContinuityMode::ReturnDefaultAndContinue,
            default_bit_value: false,
            default_word_value: 0,
            notification_interval_secs: 30,
            error_rate_warning_percent: 10.0,
        }
    }
}

impl ContinuityConfig {
    pub fn settings(&self) -> ContinuitySettings {
        ContinuitySettings {
            mode: self.mode,
            default_bit_value: self.default_bit_value,
            default_word_value: self.default_word_value,
            notification_interval: Duration::from_secs(self.notification_interval_secs),
            error_rate_warning_percent: self.error_rate_warning_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub enable_file: bool,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            enable_file: false,
            enable_json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSeed {
    pub code: DeviceCode,
    pub address: u32,
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordSeed {
    pub code: DeviceCode,
    pub address: u32,
    pub value: u16,
}

/// Simulated controller driven by the demo binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub display_name: String,
    pub type_code: u16,
    pub latency_ms: u64,
    pub fault_probability: f64,
    pub fail_every_nth: Option<u64>,
    pub fail_identification: bool,
    pub bits: Vec<BitSeed>,
    pub words: Vec<WordSeed>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            display_name: "Q02CPU".to_string(),
            type_code: 0x0041,
            latency_ms: 0,
            fault_probability: 0.0,
            fail_every_nth: None,
            fail_identification: false,
            bits: Vec::new(),
            words: Vec::new(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub target: TargetConfig,
    pub discovery: DiscoveryConfig,
    pub monitoring: MonitoringConfig,
    pub continuity: ContinuityConfig,
    pub logging: LoggingConfig,
    pub simulator: SimulatorConfig,
}

impl AppConfig {
    /// Load from a YAML file with the environment overlay, then validate
    pub fn load(path: impl AsRef<Path>) -> PlcResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            debug!("Loading configuration from {}", path.display());
        } else {
            warn!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
        }

        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| PlcError::Configuration(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without the environment overlay
    pub fn from_yaml_str(yaml: &str) -> PlcResult<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| PlcError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PlcResult<()> {
        self.target.validate()?;

        let discovery = &self.discovery;
        if let Some(batch) = discovery.batch_size {
            StaticCatalog::validate(batch, discovery.max_concurrent_scans.unwrap_or(1))?;
        }
        if let Some(concurrency) = discovery.max_concurrent_scans {
            StaticCatalog::validate(discovery.batch_size.unwrap_or(1), concurrency)?;
        }

        let monitoring = &self.monitoring;
        if monitoring.interval_ms == 0 {
            return Err(config_error!("monitoring interval must be at least 1ms"));
        }
        if monitoring.max_batch_size == 0 {
            return Err(config_error!("monitoring max_batch_size must be at least 1"));
        }
        if monitoring.max_concurrent_operations == 0 {
            return Err(config_error!(
                "monitoring max_concurrent_operations must be at least 1"
            ));
        }

        let rate = self.continuity.error_rate_warning_percent;
        if !(0.0..=100.0).contains(&rate) {
            return Err(config_error!(
                "error_rate_warning_percent {} outside 0..=100",
                rate
            ));
        }
        if !(0.0..=1.0).contains(&self.simulator.fault_probability) {
            return Err(config_error!(
                "simulator fault_probability {} outside 0..=1",
                self.simulator.fault_probability
            ));
        }
        Ok(())
    }
}
