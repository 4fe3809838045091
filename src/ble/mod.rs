//! BLE transport layer for the RPC link
//!
//! Provides the transport binding traits both roles are written against,
//! GATT attribute types, and an in-process simulated transport for testing.

pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Discovery timeout: address={address:?}, name={name:?}, timeout={timeout_ms} ms")]
    DiscoveryTimeout {
        address: Option<String>,
        name: Option<String>,
        timeout_ms: u64,
    },

    #[error("Service {service} or its read/write characteristics ({read}, {write}) not found")]
    CharacteristicsMissing {
        service: Uuid,
        read: Uuid,
        write: Uuid,
    },

    #[error("Fatal BLE link error, status {status}")]
    FatalLinkError { status: i32 },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscribeFailed(String),

    #[error("Chunk delivery failed after {attempts} attempts")]
    TransportWriteFailure { attempts: u32 },

    #[error("Chunk not acknowledged within {timeout_ms} ms")]
    AckTimeout { timeout_ms: u64 },

    #[error("Failed to read {wanted} bytes within {timeout_ms} ms, only {available} available")]
    StreamTimeout {
        wanted: usize,
        available: usize,
        timeout_ms: u64,
    },

    #[error("End of stream")]
    EndOfStream,

    #[error("Already writing")]
    WriteInProgress,

    #[error("Internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("Connection closed")]
    Closed,

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Peer disconnected")]
    Disconnected,
}

impl BleError {
    /// True for every error a reader reports when the stream can no longer
    /// deliver the requested bytes. A timed-out read counts as end of stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::StreamTimeout { .. })
    }

    /// Whether retrying the whole connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryTimeout { .. } | Self::FatalLinkError { .. }
        )
    }
}
