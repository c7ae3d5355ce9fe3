//! Gemini Live wire messages
//!
//! Client messages are externally tagged (`{"setup": …}`,
//! `{"realtimeInput": …}`); server messages carry optional fields and map to
//! zero or more [`TransportEvent`]s.

use serde::{Deserialize, Serialize};

use super::{RealtimeInput, Role, TransportEvent};
use crate::config::LiveConfig;

/// Message sent by the client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on a new connection
    Setup(Setup),
    /// Streaming microphone audio
    RealtimeInput(RealtimeInputBody),
}

/// Session setup
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
}

impl Setup {
    /// Build setup from session configuration
    #[must_use]
    pub fn from_config(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            },
            output_audio_transcription: config.output_transcription.then_some(Empty {}),
            input_audio_transcription: config.input_transcription.then_some(Empty {}),
        }
    }
}

/// Output modality
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`; presence toggles a feature
#[derive(Debug, Serialize)]
pub struct Empty {}

#[derive(Debug, Serialize)]
pub struct RealtimeInputBody {
    pub audio: RealtimeInput,
}

impl ClientMessage {
    /// Wrap an audio frame
    #[must_use]
    pub const fn audio(input: RealtimeInput) -> Self {
        Self::RealtimeInput(RealtimeInputBody { audio: input })
    }
}

/// Message received from the server
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<InboundPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

fn transcript(role: Role, transcription: Option<Transcription>) -> Option<TransportEvent> {
    transcription
        .and_then(|t| t.text)
        .filter(|text| !text.is_empty())
        .map(|text| TransportEvent::TranscriptDelta { text, role })
}

impl ServerMessage {
    /// Parse a raw JSON message
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid server message
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Events carried by this message, in the order they should be handled
    #[must_use]
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(TransportEvent::Open);
        }

        if let Some(content) = self.server_content {
            events.extend(transcript(Role::User, content.input_transcription));
            events.extend(transcript(Role::Assistant, content.output_transcription));

            let audio = content
                .model_turn
                .into_iter()
                .flat_map(|turn| turn.parts)
                .filter_map(|part| part.inline_data)
                .filter(|data| {
                    data.mime_type
                        .as_deref()
                        .is_none_or(|mime| mime.starts_with("audio/pcm"))
                })
                .map(|data| TransportEvent::AudioChunk(data.data));
            events.extend(audio);

            if content.interrupted == Some(true) {
                events.push(TransportEvent::Interrupted);
            }
            if content.turn_complete == Some(true) {
                events.push(TransportEvent::TurnComplete);
            }
        }

        if self.go_away.is_some() {
            tracing::warn!("server announced it will close the session soon");
        }

        events
    }
}
