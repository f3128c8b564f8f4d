//! Error types for origami-client.

use thiserror::Error;

use crate::control::Command;

/// Main error type for all origami operations.
///
/// Outcomes of individual requests are not reported through this type; see
/// [`ResponseError`](crate::producer::ResponseError).
#[derive(Debug, Error)]
pub enum OrigamiError {
    /// I/O error on an established socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed wire data (bad type tag, bad integer, invalid frame).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport reported an error while connecting.
    #[error("Connection error: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The stream closed, or never became ready, before the connect attempt resolved.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The socket is absent or broke before a reply arrived.
    #[error("Connection lost")]
    ConnectionLost,

    /// `request()` was called on a send-only connection.
    #[error("Connection is in send-only mode")]
    SendOnlyEnabled,

    /// `send()` was called on a connection that is not in send-only mode.
    #[error("Connection is not in send-only mode")]
    SendOnlyDisabled,

    /// A request to the server did not complete within its deadline.
    #[error("Timed out")]
    Timeout,

    /// The link's write queue is full.
    #[error("Write queue is full")]
    Backpressure,

    /// A server-side command has no source or no loaded handle when it must have one.
    #[error("Command {0} is not loaded")]
    CommandMissing(Command),

    /// The server refused the credentials.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The announce command returned a falsy reply.
    #[error("Node announce was rejected by the server")]
    AnnounceRejected,

    /// The client has been stopped and cannot be started again.
    #[error("Client is stopped")]
    Stopped,
}

/// Result type alias using OrigamiError.
pub type Result<T> = std::result::Result<T, OrigamiError>;
