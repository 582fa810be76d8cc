//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported endpoint
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// Every hole punch attempt went unanswered
    #[error("Hole punch failed after {attempts} attempts")]
    HolePunchFailed { attempts: u32 },

    /// No STUN server produced a usable answer
    #[error("All discovery servers failed")]
    AllDiscoveryServersFailed,

    /// STUN response carried somebody else's transaction id
    #[error("STUN transaction ID mismatch")]
    TransactionMismatch,

    /// STUN reply was not a binding success response
    #[error("Not a STUN binding response (type 0x{0:04x})")]
    NotBindingResponse(u16),

    /// STUN response had no usable address attribute
    #[error("No mapped address in STUN response")]
    MissingMappedAddress,

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A packet exhausted its retransmissions and the stream is broken
    #[error("Packet {sequence} lost after retransmission limit")]
    PacketLost { sequence: u32 },

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    TimeoutWithMessage(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
