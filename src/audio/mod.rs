//! # Audio Processing Module
//!
//! Everything between the microphone/speaker and the live transport.
//!
//! ## Key Components:
//! - **Codec**: float ↔ PCM16 ↔ base64 conversions
//! - **Playback**: gapless scheduling of reply audio with hard flush on interruption
//! - **Capture**: microphone frames → encoded chunks → transport
//! - **Device**: the provider abstraction the session opens devices through
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz, mono, 4096-sample blocks, sent as PCM16 little-endian
//! - **Playback**: PCM16 little-endian at the rate the remote declares (24kHz by default)

pub mod capture;    // Microphone frame forwarding
pub mod codec;      // PCM and base64 conversion
pub mod device;     // Device provider traits and the clock-driven output
pub mod playback;   // Timeline-based playback scheduler
