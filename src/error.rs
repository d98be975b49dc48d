//! Error types for dbus-courier.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for dbus-courier operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the connection engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed address or other bad argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection has not been opened yet.
    #[error("connection has not been opened")]
    NotConnected,

    /// The connection attempt is still in progress.
    #[error("connection attempt is still in progress")]
    Connecting,

    /// The connection is already established.
    #[error("connection is already established")]
    AlreadyConnected,

    /// The connection was closed by a stream failure or remote close.
    #[error("connection closed: {0}")]
    Disconnected(Arc<Error>),

    /// The connection has been disposed.
    #[error("connection has been disposed")]
    Disposed,

    /// The peer violated the D-Bus message protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A method call returned an error reply.
    #[error("method call returned an error: {0}: {1}")]
    ErrorReply(String, String),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled before it completed.
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation is not valid for this connection's current registrations or peer.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Message body deserialization failed.
    #[error("failed to deserialize message body: {0}")]
    Deserialize(String),

    /// Message body serialization failed.
    #[error("failed to serialize message body: {0}")]
    Serialize(String),
}

impl From<zvariant::Error> for Error {
    fn from(err: zvariant::Error) -> Self {
        Error::Deserialize(err.to_string())
    }
}
