//! jarvis-live - realtime voice and vision sessions with the Gemini Live API
//!
//! Streams microphone audio and camera frames up to the model and plays the
//! model's spoken replies back gaplessly, while keeping a running transcript.
//! Device access sits behind the traits in [`devices`]; PulseAudio and xcap
//! backends are behind the `pulse` and `capture` features.

#![forbid(unsafe_code)]

pub mod config;
pub mod devices;
pub mod downlink;
pub mod error;
pub mod gemini;
pub mod session;
pub mod transport;
pub mod uplink;

/// PulseAudio microphone and speaker
#[cfg(feature = "pulse")]
pub mod audio;
/// Screen-backed video source
#[cfg(feature = "capture")]
pub mod screen;

#[cfg(test)]
mod fakes;

pub use config::LiveConfig;
pub use devices::FacingMode;
pub use downlink::TurnPair;
pub use error::{LiveError, Result};
pub use session::{LiveSession, SessionCommand, SessionOutcome, SessionView};
pub use transport::{GeminiConnector, Status};
