//! # Gemini Coach Features
//!
//! REST client for the request/response coach features (market insights,
//! mastermind advice, job analysis, vision board images).

pub mod client;
pub mod types;

pub use client::{GeminiClient, GeminiError};
pub use types::{ChatTurn, ImageSize, WebSource};
