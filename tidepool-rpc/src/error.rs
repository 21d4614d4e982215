//! Error types for the RPC layer.
//!
//! Outbound-path errors (no connection, closed connection, timeout) are
//! always delivered through request futures, never raised synchronously.
//! Inbound decode errors close the connection, with the error carried as
//! the close cause.

use std::io;
use thiserror::Error;

use crate::frame::FrameError;

/// Errors surfaced to callers of the RPC layer.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The connection closed while the request was in flight.
    #[error("connection closed with request in flight")]
    ConnectionClosed,

    /// The request never reached the wire: the connection was already
    /// closed when it was submitted, or closed while it sat queued.
    #[error("request not sent: connection unavailable")]
    RequestNotSent,

    /// The per-request timer fired before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The supervisor had no connection to route the request to.
    #[error("no connection available")]
    NoConnection,

    /// A connection attempt failed and the reconnect policy gave up.
    #[error("connect failed: {message}")]
    Connect {
        /// Details of the final connection failure.
        message: String,
    },

    /// An I/O operation on the transport failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<io::Error> for RpcError {
    fn from(error: io::Error) -> Self {
        RpcError::Io(error.to_string())
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;
