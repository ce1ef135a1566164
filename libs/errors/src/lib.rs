//! Unified error handling for the discovery services
//!
//! This module provides the error taxonomy shared by the scanner, the adaptive
//! monitor and the discovery orchestrator. Communication faults are modelled as
//! their own type so that the continuity policy can absorb them without ever
//! touching fatal conditions such as validation failures or cancellation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CommunicationFault - single-call protocol failure
// ============================================================================

/// Kind of a single-call protocol failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// No reply within the connection's receive timeout
    Timeout,
    /// Reply arrived but could not be decoded
    MalformedReply,
    /// Target answered with a busy / error end code
    TargetBusy,
    /// Channel is not connected
    Disconnected,
    /// Anything else reported by the channel
    Other,
}

impl FaultKind {
    /// Stable name used in statistics keys and structured events
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Timeout => "timeout",
            FaultKind::MalformedReply => "malformed_reply",
            FaultKind::TargetBusy => "target_busy",
            FaultKind::Disconnected => "disconnected",
            FaultKind::Other => "other",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed protocol call (timeout, malformed reply, target busy, ...)
///
/// Returned by every `ProtocolChannel` primitive. Always recoverable: the
/// continuity policy decides whether it propagates or is replaced by defaults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CommunicationFault {
    pub kind: FaultKind,
    pub message: String,
}

impl CommunicationFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::MalformedReply, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TargetBusy, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Disconnected, message)
    }
}

// ============================================================================
// PlcError - Main error type
// ============================================================================

/// Main error type for the discovery and monitoring pipeline
#[derive(Debug, Error)]
pub enum PlcError {
    // ======================================
    // Recoverable
    // ======================================
    #[error("Communication fault: {0}")]
    Communication(#[from] CommunicationFault),

    #[error("Configuration gap: {0}")]
    ConfigurationGap(String),

    // ======================================
    // Caller errors (fail fast)
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // ======================================
    // Control flow
    // ======================================
    #[error("Operation cancelled")]
    Cancelled,

    // ======================================
    // Runtime
    // ======================================
    #[error("State error: {0}")]
    State(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using PlcError
pub type PlcResult<T> = Result<T, PlcError>;

impl PlcError {
    /// Stable error code (for logs and structured events)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Communication(_) => "COMMUNICATION_FAULT",
            Self::ConfigurationGap(_) => "CONFIGURATION_GAP",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::State(_) => "STATE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Cooperative cancellation is not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::PlcError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PlcError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::PlcError::Validation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::PlcError::Validation(format!($fmt, $($arg)*))
    };
}

// Tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_converts_into_communication_error() {
        let fault = CommunicationFault::timeout("no reply after 3000ms");
        let err: PlcError = fault.clone().into();
        assert_eq!(err.error_code(), "COMMUNICATION_FAULT");
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_error_codes() {
        assert!(PlcError::Cancelled.is_cancellation());
        assert!(!PlcError::Validation("M99999".into()).is_cancellation());
        assert_eq!(
            PlcError::ConfigurationGap("no devices".into()).error_code(),
            "CONFIGURATION_GAP"
        );
    }

    #[test]
    fn test_macros() {
        let err = validation_error!("range {}..{} inverted", 10, 5);
        assert!(matches!(err, PlcError::Validation(ref m) if m == "range 10..5 inverted"));
        let err = config_error!("missing target");
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_fault_kind_names() {
        assert_eq!(FaultKind::MalformedReply.to_string(), "malformed_reply");
        assert_eq!(
            CommunicationFault::busy("end code 0xC051").to_string(),
            "target_busy: end code 0xC051"
        );
    }
}
