//! # Live API Wire Protocol
//!
//! Typed JSON messages exchanged with the remote conversational service.
//!
//! ## Message Flow:
//! 1. **Client → Server**: `{"setup": {...}}` once, right after the socket opens
//! 2. **Server → Client**: `{"setupComplete": {}}` when the session is ready
//! 3. **Client → Server**: `{"realtimeInput": {"mediaChunks": [...]}}` per captured frame
//! 4. **Server → Client**: `{"serverContent": {...}}` with reply audio, turn
//!    boundaries and interruption flags
//!
//! Inbound frames are parsed into the loosely-shaped [`ServerMessage`] and then
//! validated into a list of [`ServerEvent`]s, so the rest of the crate only
//! ever sees well-formed, tagged events.

use crate::audio::codec::{is_pcm_mime, EncodedChunk};
use crate::live::error::TransportError;
use crate::live::transport::LiveSetup;
use serde::{Deserialize, Serialize};

/// Messages sent to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedChunk>,
}

impl SetupMessage {
    /// Build the setup message for a session. Output modality is always audio.
    pub fn from_setup(setup: &LiveSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        }
    }
}

impl ClientMessage {
    pub fn setup(setup: &LiveSetup) -> Self {
        ClientMessage::Setup(SetupMessage::from_setup(setup))
    }

    pub fn audio(chunk: EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Raw inbound frame as the service sends it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Base64 reply audio as received, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    pub data: String,
    pub mime_type: String,
}

/// Validated inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The service accepted the setup message.
    SetupComplete,
    /// A chunk of spoken reply.
    Audio(InboundAudio),
    /// The user talked over the model; pending reply audio must be discarded.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The service will close the connection soon.
    GoAway { time_left: Option<String> },
}

/// Parse one inbound frame into events.
///
/// ## Ordering:
/// Audio parts come first (in part order), then the interruption flag, then
/// turn completion. A frame with none of these yields an empty list.
pub fn parse_server_message(raw: &str) -> Result<Vec<ServerEvent>, TransportError> {
    let message: ServerMessage = serde_json::from_str(raw)
        .map_err(|e| TransportError::Protocol(format!("invalid server message: {}", e)))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|inline| is_pcm_mime(&inline.mime_type) && !inline.data.is_empty())
                    .map(|inline| {
                        ServerEvent::Audio(InboundAudio {
                            data: inline.data,
                            mime_type: inline.mime_type,
                        })
                    }),
            );
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    Ok(events)
}
