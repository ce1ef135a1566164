//! Discovery pipeline core
//!
//! Value types, the protocol channel seam, capability catalog, continuity
//! policy, scanner, monitor and orchestrator.

pub mod bootstrap;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod continuity;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod scanner;
pub mod simulator;
pub mod types;
