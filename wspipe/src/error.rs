use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the tunnel core.
///
/// Pump-internal failures (socket I/O, deadlines) never reach callers as
/// values; they terminate the owning pump and trigger teardown. Everything
/// here is what `send_request` and friends can actually return.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot serialize http message: {0}")]
    Serialize(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("invalid message type {found}, expected {expected}")]
    TypeMismatch { expected: u8, found: u8 },

    #[error("cannot parse http message: {0}")]
    Parse(String),

    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),

    #[error("unable to find connection with id {id:?}")]
    ConnectionNotFound { id: Option<String> },

    #[error("timed out after {0:?} waiting for response to message {1}")]
    Timeout(Duration, Uuid),

    #[error("response channel for message {0} has been closed")]
    ChannelClosed(Uuid),

    #[error("send queue is full")]
    QueueFull,

    #[error("websocket transport error: {0}")]
    Transport(String),
}
