//! Gemini Live API wire protocol
//!
//! Message shapes for the BidiGenerateContent websocket: the setup frame,
//! realtime media frames going up, and server messages coming down.

use crate::config::LiveConfig;
use crate::transport::InboundEvent;
use crate::uplink::{ChunkKind, MediaChunk};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// The engine only asks for spoken replies.
const AUDIO_MODALITY: &str = "AUDIO";

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Enables transcription; the API takes an empty object.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AudioTranscriptionConfig {}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Audio responses with both transcription directions enabled.
    pub fn for_live(config: &LiveConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![AUDIO_MODALITY.to_string()],
            }),
            system_instruction: config.system_instruction.as_ref().map(|instruction| Content {
                role: None,
                parts: vec![Part {
                    text: Some(instruction.clone()),
                }],
            }),
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<MediaChunk> for ClientMessage {
    fn from(chunk: MediaChunk) -> Self {
        let blob = Blob {
            data: chunk.data,
            mime_type: chunk.mime_type,
        };
        let realtime_input = match chunk.kind {
            ChunkKind::Audio => RealtimeInput {
                audio: Some(blob),
                ..Default::default()
            },
            ChunkKind::Image => RealtimeInput {
                video: Some(blob),
                ..Default::default()
            },
        };
        ClientMessage::RealtimeInput(realtime_input)
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerContent {
    /// Flatten into inbound events. Transcript fragments and audio always
    /// precede the turn-complete marker carried by the same message.
    pub fn into_events(self) -> SmallVec<[InboundEvent; 4]> {
        let mut events = SmallVec::new();

        if let Some(t) = self.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::UserTranscript(t.text));
        }
        if let Some(t) = self.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::ModelTranscript(t.text));
        }
        if let Some(turn) = self.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data.filter(|d| !d.data.is_empty()) {
                    events.push(InboundEvent::AudioChunk(inline.data));
                }
            }
        }
        if self.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }

        events
    }
}

/// Server -> client messages
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}
