//! PLC Device Discovery Service (`discsrv`)
//!
//! Runs discovery against the configured simulated controller and keeps
//! monitoring the live devices until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use discsrv::core::bootstrap::{self, Args};
use discsrv::core::config::AppConfig;
use discsrv::core::simulator::SimulatedChannel;
use discsrv::runtime::run_service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config_path();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    bootstrap::initialize_logging(&args, &config)?;
    info!(
        "discsrv {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    if args.validate {
        bootstrap::validate_configuration(&config)?;
        return Ok(());
    }

    let channel = Arc::new(SimulatedChannel::from_config(&config.simulator));
    let shutdown = CancellationToken::new();
    let signal_task = common::cancel_on_shutdown(shutdown.clone());

    let report = run_service(&config, channel, args.once, shutdown.clone()).await?;
    if args.once {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    signal_task.abort();
    info!("discsrv stopped: {}", report);
    Ok(())
}
