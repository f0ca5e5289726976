//! Error types for the live session and its transport.

use crate::audio::device::DeviceAccessError;
use thiserror::Error;

/// Why `LiveSession::connect` did not produce a usable session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Microphone or speaker could not be acquired.
    #[error(transparent)]
    Device(#[from] DeviceAccessError),

    /// The remote service refused or dropped the opening handshake.
    #[error("transport handshake failed: {0}")]
    Handshake(String),

    /// The setup message could not be serialized.
    #[error("failed to encode setup message: {0}")]
    Setup(#[from] serde_json::Error),

    /// A connection is already open (or opening) on this session.
    #[error("live session is already active")]
    AlreadyActive,

    /// `disconnect()` was called while the connection was still being set up.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

/// Runtime failure of an established transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport's outbound queue is gone (socket already shut down).
    #[error("transport channel closed")]
    ChannelClosed,

    /// The underlying socket failed.
    #[error("websocket error: {0}")]
    Socket(String),

    /// The remote sent something that doesn't match the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Short machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Device(DeviceAccessError::PermissionDenied) => "permission_denied",
            ConnectError::Device(_) => "device_unavailable",
            ConnectError::Handshake(_) => "handshake_failed",
            ConnectError::Setup(_) => "setup_failed",
            ConnectError::AlreadyActive => "already_active",
            ConnectError::Cancelled => "cancelled",
        }
    }
}
