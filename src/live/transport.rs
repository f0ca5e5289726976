//! # Live Transport Abstraction
//!
//! The session talks to the remote service through two traits:
//! - **LiveTransport**: opens a connection for a given [`LiveSetup`]
//! - **TransportHandle**: the open connection's send/close side
//!
//! Everything the remote side says comes back as [`TransportEvent`]s on a
//! tokio channel, which the session's event pump drains in arrival order.

use crate::audio::codec::EncodedChunk;
use crate::live::error::{ConnectError, TransportError};
use crate::live::protocol::ServerEvent;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Fixed remote configuration for a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    /// Model identifier, with or without the `models/` prefix
    pub model: String,

    /// Prebuilt voice the model speaks with
    pub voice_name: String,

    /// System preamble that sets the coach persona
    pub system_instruction: String,
}

/// Something the remote side did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The service finished the handshake and accepted the setup.
    Open,
    /// A validated inbound message.
    Message(ServerEvent),
    /// The connection failed; no further events follow.
    Error(TransportError),
    /// The connection closed; no further events follow.
    Closed { reason: Option<String> },
}

/// Send side of an open connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Queue one audio chunk. Never waits on the network.
    fn send_audio(&self, chunk: EncodedChunk) -> Result<(), TransportError>;

    /// Ask the remote side to close and wait until the request is handed off.
    async fn close(&self);
}

/// An open connection: where to send, and where events arrive.
pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for connections to the remote conversational service.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn open(&self, setup: &LiveSetup) -> Result<TransportConnection, ConnectError>;
}

/// The session's transport slot. Written by the session, read by capture.
pub type SharedLink = Arc<RwLock<Option<Arc<dyn TransportHandle>>>>;
