//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **#[serde(default, skip_serializing)]**: Field attributes that keep secrets out of serialized output
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY` / `API_KEY` environment variables
//! 2. Environment variables (APP_SERVER__HOST, APP_LIVE__VOICE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket server listens
/// - **gemini**: credentials, endpoints and model ids for the remote coach
/// - **live**: persona of the real-time voice coach
/// - **audio**: capture and playback formats for live sessions
/// - **performance**: limits on concurrent live sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Gemini API access.
///
/// ## Secrets:
/// `api_key` is read from config/env but never serialized, so it cannot leak
/// through `GET /api/v1/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// REST base, e.g. `https://generativelanguage.googleapis.com/v1beta`
    pub api_base: String,

    /// Live API WebSocket endpoint (`BidiGenerateContent`)
    pub live_endpoint: String,

    pub insights_model: String,
    pub mastermind_model: String,
    pub analysis_model: String,
    pub image_model: String,

    /// Thinking budget (tokens) for mastermind advice
    pub thinking_budget: u32,
}

/// Real-time voice coach setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
}

/// Audio formats used by live sessions.
///
/// ## Fields:
/// - `input_sample_rate`: microphone capture rate sent upstream (16kHz)
/// - `output_sample_rate`: rate reply audio is decoded at when the remote doesn't say (24kHz)
/// - `output_channels`: playback channel count
/// - `capture_block_size`: samples per captured frame (4096)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub capture_block_size: usize,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Maximum number of live sessions (open `/ws/live` sockets)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gemini: GeminiConfig {
                api_key: String::new(),
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                live_endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                insights_model: "gemini-2.5-flash".to_string(),
                mastermind_model: "gemini-3-pro-preview".to_string(),
                analysis_model: "gemini-3-pro-preview".to_string(),
                image_model: "gemini-3-pro-image-preview".to_string(),
                thinking_budget: 32768,
            },
            live: LiveConfig {
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice_name: "Zephyr".to_string(),
                system_instruction: "You are the IncomeStack Wealth Coach. You are energetic, professional, and concise. You help the user with career advice and financial data.".to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: INPUT_SAMPLE_RATE,
                output_sample_rate: OUTPUT_SAMPLE_RATE,
                output_channels: 1,
                capture_block_size: 4096,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and the API key
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__VOICE_NAME=Puck`: Override the coach voice
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_SESSIONS=50`
    /// - `GEMINI_API_KEY=...` (or `API_KEY=...`): Gemini credentials
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Single underscore after the prefix, double between nested keys,
            // so `max_concurrent_sessions` survives intact
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("gemini.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one live session is allowed
    /// - Sample rates, channel count and capture block size are non-zero
    ///
    /// A missing API key is not an error: the server still starts, coach
    /// features degrade to their fallbacks and live connects fail the handshake.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.output_channels == 0 {
            return Err(anyhow::anyhow!("Output channel count must be greater than 0"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        Ok(())
    }

    /// Whether Gemini credentials are configured.
    pub fn has_api_key(&self) -> bool {
        !self.gemini.api_key.trim().is_empty()
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example `{"live": {"voice_name": "Puck"}}`
    /// changes the voice of sessions opened from now on. The `gemini` section
    /// cannot be changed at runtime.
    ///
    /// The update is applied to a copy and only committed if it validates.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                updated.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                updated.server.port = narrow("server.port", port)?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                updated.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                updated.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                updated.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("input_sample_rate").and_then(|v| v.as_u64()) {
                updated.audio.input_sample_rate = narrow("audio.input_sample_rate", rate)?;
            }
            if let Some(rate) = audio.get("output_sample_rate").and_then(|v| v.as_u64()) {
                updated.audio.output_sample_rate = narrow("audio.output_sample_rate", rate)?;
            }
            if let Some(channels) = audio.get("output_channels").and_then(|v| v.as_u64()) {
                updated.audio.output_channels = narrow("audio.output_channels", channels)?;
            }
            if let Some(block) = audio.get("capture_block_size").and_then(|v| v.as_u64()) {
                updated.audio.capture_block_size = narrow("audio.capture_block_size", block)?;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                updated.performance.max_concurrent_sessions = narrow("performance.max_concurrent_sessions", sessions)?;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Convert a JSON integer to the field's type, rejecting values that don't fit.
fn narrow<T: TryFrom<u64>>(field: &str, value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| anyhow::anyhow!("{} out of range: {}", field, value))
}
