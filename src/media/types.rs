#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when a call into the external media engine rejects
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct EngineError {
    pub operation: &'static str,
    pub reason: String,
}

impl EngineError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// Custom error type for room and media-session operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("No room found for peer: {0}")]
    NoRoomForPeer(String),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Room already exists: {0}")]
    RoomAlreadyExists(String),

    #[error("No workers available: {0}")]
    NoWorkers(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),
}

impl MediaError {
    /// True for every "entity absent" variant
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MediaError::RoomNotFound(_)
                | MediaError::NoRoomForPeer(_)
                | MediaError::ParticipantNotFound(_)
                | MediaError::TransportNotFound(_)
                | MediaError::ProducerNotFound(_)
                | MediaError::ConsumerNotFound(_)
        )
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of media carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Caller-set metadata bag attached to engine entities at creation time
pub type AppData = serde_json::Map<String, serde_json::Value>;

/// Key and value marking a producer as a screen share
pub const MEDIA_TYPE_KEY: &str = "mediaType";
pub const SCREEN_MEDIA_TYPE: &str = "screen";

/// Whether creation metadata tags the entity as a screen share
pub fn is_screen_share(app_data: &AppData) -> bool {
    app_data
        .get(MEDIA_TYPE_KEY)
        .and_then(|v| v.as_str())
        .is_some_and(|v| v == SCREEN_MEDIA_TYPE)
}
