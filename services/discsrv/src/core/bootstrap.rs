//! Service bootstrap
//!
//! Command-line arguments, logging setup and configuration validation for
//! the `discsrv` binary.

use std::path::PathBuf;

use clap::Parser;
use errors::{PlcError, PlcResult};
use tracing::{debug, info, Level};

use super::catalog::{DeviceCapabilityCatalog, StaticCatalog};
use super::config::{AppConfig, DEFAULT_CONFIG_PATH};

pub const SERVICE_NAME: &str = "discsrv";
/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "DISCSRV_CONFIG";
/// Environment variable overriding the configured log level
pub const LOG_LEVEL_ENV: &str = "DISCSRV_LOG_LEVEL";

/// Command-line arguments for discsrv
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "discsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "PLC device discovery and adaptive monitoring service",
    long_about = None
)]
pub struct Args {
    /// Configuration file (falls back to DISCSRV_CONFIG, then config/discsrv.yaml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides DISCSRV_LOG_LEVEL and the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    /// Run one discovery session, print the status report and exit
    #[arg(long)]
    pub once: bool,
}

impl Args {
    /// Config path with priority: CLI > DISCSRV_CONFIG > default
    pub fn config_path(&self) -> PathBuf {
        let explicit = self
            .config
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        PathBuf::from(common::get_string_config(
            explicit,
            CONFIG_ENV,
            DEFAULT_CONFIG_PATH,
        ))
    }
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_log_level(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Console level with priority: CLI > DISCSRV_LOG_LEVEL > config file
pub fn resolve_log_level(args: &Args, config: &AppConfig) -> Level {
    common::get_config_value(
        args.log_level.as_deref().map(parse_log_level),
        LOG_LEVEL_ENV,
        parse_log_level(&config.logging.level),
    )
}

/// Initialize logging from CLI arguments and the `logging` config section
pub fn initialize_logging(args: &Args, config: &AppConfig) -> PlcResult<()> {
    let log_config = common::logging::LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir: config
            .logging
            .enable_file
            .then(|| config.logging.dir.join(SERVICE_NAME)),
        console_level: resolve_log_level(args, config),
        enable_json: config.logging.enable_json,
        enable_ansi: !args.no_color,
        ..Default::default()
    };

    common::logging::init_with_config(log_config)
        .map_err(|e| PlcError::Configuration(format!("Failed to init logging: {}", e)))
}

/// Log what a configuration would do without touching the target
pub fn validate_configuration(config: &AppConfig) -> PlcResult<()> {
    config.validate()?;

    let target = &config.target;
    info!(
        "Target: {} at {} (connect {}ms, receive {}ms)",
        target.display_name,
        target.endpoint(),
        target.connect_timeout_ms,
        target.receive_timeout_ms
    );

    let catalog = StaticCatalog::new(config.discovery.mode);
    let caps = catalog.get_supported_devices(config.simulator.type_code);
    let batch = config
        .discovery
        .batch_size
        .unwrap_or(caps.recommended_batch_size);
    let concurrency = config
        .discovery
        .max_concurrent_scans
        .unwrap_or(caps.recommended_concurrency);
    StaticCatalog::validate(batch, concurrency)?;
    info!(
        "Discovery: {} mode, {} series, {} device code(s), batch {}, concurrency {}",
        config.discovery.mode.as_str(),
        caps.series,
        caps.device_count(),
        batch,
        concurrency
    );
    for device in &caps.ranges {
        info!(
            "  {:<3} {:<32} {} (priority {})",
            device.code.name(),
            device.code.description(),
            device.range,
            device.range.priority
        );
    }

    info!(
        "Monitoring: every {}ms, {} x {} devices per cycle",
        config.monitoring.interval_ms,
        config.monitoring.max_batch_size,
        config.monitoring.max_concurrent_operations
    );
    info!("Continuity: {}", config.continuity.mode);

    let effective = serde_yaml::to_string(config)
        .map_err(|e| PlcError::Internal(format!("config serialization: {}", e)))?;
    debug!("Effective configuration:\n{}", effective);
    info!("Configuration validation completed successfully");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["discsrv", "--config", "x.yaml", "--once", "-l", "debug"]);
        assert_eq!(args.config, Some(PathBuf::from("x.yaml")));
        assert!(args.once);
        assert!(!args.validate);
        assert_eq!(args.config_path(), PathBuf::from("x.yaml"));
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_log_level("warning"), Level::WARN);
        assert_eq!(parse_log_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_cli_log_level_wins_over_config() {
        let mut config = AppConfig::default();
        config.logging.level = "warn".to_string();
        let args = Args {
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_log_level(&args, &config), Level::TRACE);
    }

    #[test]
    fn test_validate_default_configuration() {
        assert!(validate_configuration(&AppConfig::default()).is_ok());
    }
}
