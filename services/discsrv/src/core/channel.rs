//! Protocol channel abstraction
//!
//! Block read primitives over an open connection. Frame encoding lives behind
//! this trait; the pipeline only sees decoded bits and words.

use async_trait::async_trait;
use errors::CommunicationFault;

use super::types::{DeviceCode, DeviceKind, TargetIdentity};

/// Maximum points in one bit-block read
pub const MAX_BIT_BATCH: usize = 7168;
/// Maximum points in one word-block read
pub const MAX_WORD_BATCH: usize = 960;

/// Protocol hard maximum for one block read of the given kind
pub fn protocol_max(kind: DeviceKind) -> usize {
    match kind {
        DeviceKind::Bit => MAX_BIT_BATCH,
        DeviceKind::Word => MAX_WORD_BATCH,
    }
}

/// Request/response device-memory channel to one controller
///
/// Every call either succeeds completely or returns a `CommunicationFault`;
/// timeouts come from the connection's receive timeout.
#[async_trait]
pub trait ProtocolChannel: Send + Sync {
    async fn connect(&self) -> Result<(), CommunicationFault>;

    async fn disconnect(&self) -> Result<(), CommunicationFault>;

    async fn is_alive(&self) -> bool;

    /// Request the controller's display name and type code
    async fn identify_target(&self) -> Result<TargetIdentity, CommunicationFault>;

    /// Read `count` consecutive bits starting at `address` (`count <= MAX_BIT_BATCH`)
    async fn read_bits(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<bool>, CommunicationFault>;

    /// Read `count` consecutive words starting at `address` (`count <= MAX_WORD_BATCH`)
    async fn read_words(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<u16>, CommunicationFault>;

    /// Channel name for logging
    fn name(&self) -> &str;
}
