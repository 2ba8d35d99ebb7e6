//! Per-stage error taxonomy.
//!
//! Only `CatalogUnavailable` is fatal. Every other variant is scoped to a
//! single camera or file and is logged by the orchestrator, which then moves
//! on to the next unit of work.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageError {
    /// Camera list endpoint failed or returned a malformed payload.
    CatalogUnavailable(String),
    /// Detail page for one location had no usable camera id.
    CameraResolutionFailed { location_id: u64, reason: String },
    /// Network failure during fetch or upload.
    Transport(String),
    /// Undersized, truncated or otherwise unusable image payload.
    InvalidImage(String),
    /// Image bytes could not be decoded.
    Decode(String),
    /// Telemetry sink refused or could not be reached.
    SinkUnavailable(String),
    /// File name does not carry the `{camera}_{location}_{epoch}.jpg` fields.
    Unidentifiable(String),
    /// Local filesystem or object store failure.
    Storage(String),
}

impl StageError {
    pub fn code(&self) -> &'static str {
        match self {
            StageError::CatalogUnavailable(_) => "CATALOG_UNAVAILABLE",
            StageError::CameraResolutionFailed { .. } => "CAMERA_RESOLUTION_FAILED",
            StageError::Transport(_) => "TRANSPORT_ERROR",
            StageError::InvalidImage(_) => "INVALID_IMAGE",
            StageError::Decode(_) => "DECODE_ERROR",
            StageError::SinkUnavailable(_) => "SINK_UNAVAILABLE",
            StageError::Unidentifiable(_) => "UNIDENTIFIABLE_FILE",
            StageError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::CatalogUnavailable(_))
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::CameraResolutionFailed {
                location_id,
                reason,
            } => write!(f, "{}: location {}: {}", self.code(), location_id, reason),
            StageError::CatalogUnavailable(msg)
            | StageError::Transport(msg)
            | StageError::InvalidImage(msg)
            | StageError::Decode(msg)
            | StageError::SinkUnavailable(msg)
            | StageError::Unidentifiable(msg)
            | StageError::Storage(msg) => write!(f, "{}: {}", self.code(), msg),
        }
    }
}

impl std::error::Error for StageError {}
