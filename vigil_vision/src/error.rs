//! Error types for the surveillance pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for pipeline operations.
pub type VisionResult<T> = Result<T, VisionError>;

/// Failures that propagate out of the pipeline.
///
/// Per-frame anomalies (no corners, no detections, empty masks) are never
/// represented here; they are normal branches.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Unable to open source: {0}")]
    SourceOpen(String),

    #[error("Failed to read frame from source: {0}")]
    SourceRead(String),

    #[error("Model artifact not found: {}", .0.display())]
    ModelArtifactMissing(PathBuf),

    #[error("Failed to load detection model: {0}")]
    ModelLoad(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Failed to write clip {}: {message}", .path.display())]
    ClipWrite { path: PathBuf, message: String },

    #[error("Frame size changed from {expected:?} to {actual:?}")]
    FrameSizeChanged {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl VisionError {
    /// Create a clip write error for a destination.
    pub fn clip_write(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ClipWrite {
            path: path.into(),
            message: message.into(),
        }
    }
}
