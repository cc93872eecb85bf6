//! Session configuration, read from the environment.

use crate::devices::FacingMode;
use crate::error::{LiveError, Result};
use std::time::Duration;

const ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are J.A.R.V.I.S., a sophisticated and highly intelligent AI assistant with a professional and helpful demeanor. Your responses should be a seamless blend of English and Hindi (Hinglish). You are precise, slightly witty, and always at service. Aapko har sawal ka jawab dena hai jaise aap Tony Stark ke personal AI ho.";

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: Option<String>,
    /// Rate declared for uplink PCM (`audio/pcm;rate=16000`)
    pub input_sample_rate: u32,
    /// Rate of the PCM the model streams back
    pub output_sample_rate: u32,
    /// Samples per captured audio frame
    pub audio_frame_len: usize,
    pub video_fps: u32,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    pub initial_facing: FacingMode,
    pub setup_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: ENDPOINT.to_string(),
            api_key: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            audio_frame_len: 4096,
            video_fps: 15,
            jpeg_quality: 80,
            initial_facing: FacingMode::Front,
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl LiveConfig {
    /// Build a config from `GEMINI_API_KEY` (or `API_KEY`) plus optional
    /// `JARVIS_MODEL`, `JARVIS_SYSTEM_INSTRUCTION` and `JARVIS_FACING`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("GEMINI_API_KEY")
            .or_else(|| lookup("API_KEY"))
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LiveError::Config("GEMINI_API_KEY is not set".to_string()))?;

        let mut config = Self::default().with_api_key(api_key);

        if let Some(model) = lookup("JARVIS_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(instruction) = lookup("JARVIS_SYSTEM_INSTRUCTION") {
            config.system_instruction = Some(instruction).filter(|s| !s.trim().is_empty());
        }
        if let Some(facing) = lookup("JARVIS_FACING") {
            config.initial_facing = FacingMode::parse(&facing)
                .ok_or_else(|| LiveError::Config(format!("unknown facing mode '{}'", facing)))?;
        }

        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into().trim().to_string();
        self
    }

    pub fn websocket_url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    pub fn video_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.video_fps.max(1)))
    }
}
