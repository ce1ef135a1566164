//! Shared service plumbing for the discovery services
//!
//! Provides basic functions shared by all services, including:
//! - logging initialization
//! - shutdown signal handling
//! - configuration value resolution

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::{get_config_value, get_string_config};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
