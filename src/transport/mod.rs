//! Transport abstraction the relay delivers through.
//!
//! The transport owns live connections and their group membership. The relay
//! only ever names groups; it never enumerates members.
//!
//! - `InMemoryGroupTransport`: in-process registry backing the WebSocket endpoint

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::hub::ServerMessage;

pub use memory::{ConnectionHandle, InMemoryGroupTransport, TransportStats};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Transport rejected the operation: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether this is a timeout-class failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Group-addressed delivery surface.
///
/// Implementations must tolerate concurrent group mutation and delivery, and
/// `add_to_group` must be idempotent.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Add a live connection to a named group
    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<(), TransportError>;

    /// Deliver a message to every connection in a group
    async fn send_to_group(&self, group: &str, message: &ServerMessage)
        -> Result<(), TransportError>;

    /// Deliver a message to every live connection
    async fn send_to_all(&self, message: &ServerMessage) -> Result<(), TransportError>;

    /// Deliver a message to every live connection outside the excluded groups
    async fn send_to_all_except(
        &self,
        message: &ServerMessage,
        excluded_groups: &[String],
    ) -> Result<(), TransportError>;
}
