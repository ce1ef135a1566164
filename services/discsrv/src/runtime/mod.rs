//! Runtime Orchestration Layer
//!
//! Service lifecycle around the discovery orchestrator and the periodic
//! status reporting task.

pub mod lifecycle;
pub mod status;

pub use lifecycle::{build_orchestrator, run_service};
pub use status::start_status_reporter;
