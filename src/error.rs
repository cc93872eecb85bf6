//! Error taxonomy for the live session engine.
//!
//! Every fatal condition ends up as one `LiveError` whose `Display` text is
//! the message shown to the user next to the end-conversation control.

use crate::devices::{DeviceError, DeviceKind};

/// Marker the remote endpoint uses when the credential does not resolve to
/// a usable project/model.
const ENTITY_NOT_FOUND_MARKERS: [&str; 2] = ["entity was not found", "entity not found"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    #[error("{} access was denied. Please allow {} permissions and try again.", .device.title(), .device.noun())]
    PermissionDenied { device: DeviceKind },

    #[error("No {} was found on this device.", .device.noun())]
    DeviceNotFound { device: DeviceKind },

    #[error("Failed to start session: {0}. Please check camera/microphone permissions.")]
    Device(String),

    #[error("The API key was rejected ({0}). Provide a new key to retry.")]
    InvalidCredential(String),

    #[error("An API error occurred ({0}). The session has ended.")]
    Transport(String),

    #[error("Connection closed before the session opened.")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LiveError {
    /// Classify an error message reported by the remote endpoint.
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if ENTITY_NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
            LiveError::InvalidCredential(message)
        } else {
            LiveError::Transport(message)
        }
    }

    /// Only a rejected credential can be fixed by the caller and retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LiveError::InvalidCredential(_))
    }

    pub(crate) fn from_device(device: DeviceKind, err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => LiveError::PermissionDenied { device },
            DeviceError::NotFound => LiveError::DeviceNotFound { device },
            DeviceError::Stopped => LiveError::Device(format!("{} was stopped", device.noun())),
            DeviceError::Backend(msg) => LiveError::Device(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
