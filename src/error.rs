//! Error types for the transport.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An argument violated the call contract
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The connection is in the wrong state for the operation
    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),

    /// Send window full; retry after the next POLLOUT event
    #[error("send window full")]
    Again,

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// The handle does not name a live connection on this endpoint
    #[error("unknown connection handle")]
    UnknownConnection,

    /// Host name did not resolve to a usable address
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// Invalid packet or extension framing
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is backpressure; the operation succeeds once
    /// acknowledgments free the window.
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again)
    }

    /// Check if this error reports a caller mistake rather than a
    /// transient condition.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::InvalidState(_)
                | Error::VersionMismatch { .. }
                | Error::UnknownConnection
        )
    }
}
