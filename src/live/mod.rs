//! # Live Coaching Session
//!
//! Real-time, bidirectional voice conversation with the remote coach model.
//!
//! ## Module Organization:
//! - `status`: session status values and the observer hub
//! - `protocol`: typed wire messages for the Live API
//! - `transport`: the transport traits the session is written against
//! - `gemini`: WebSocket transport to Gemini Live
//! - `session`: the session state machine tying devices and transport together

pub mod error;
pub mod gemini;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use error::ConnectError;
pub use gemini::GeminiLiveTransport;
pub use session::{LiveSession, LiveSessionConfig};
pub use status::{SessionStatus, SubscriptionId};
pub use transport::LiveTransport;
