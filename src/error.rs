//! Error types for Prism.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using Prism's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Prism operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The capture stream never connected.
    #[error("capture stream failed to connect: {0}")]
    Connect(String),

    /// The capture source produced no frame within the bounded wait.
    #[error("no frame from capture source within {0:?}")]
    FrameTimeout(Duration),

    /// Exporting a frame's image as an external memory handle failed.
    #[error("frame export failed: {0}")]
    Export(String),

    /// Converter configuration failed during pipeline construction.
    #[error("converter setup failed: {0}")]
    Setup(String),

    /// The converter rejected a buffer submission.
    #[error("buffer submission to {plane} plane failed: {reason}")]
    Submit {
        /// Which plane rejected the buffer.
        plane: &'static str,
        /// Device-reported reason.
        reason: String,
    },

    /// The converter reported an error or a malformed completion.
    #[error("converter device error: {0}")]
    Device(String),

    /// The downstream sink rejected a converted frame.
    #[error("sink error: {0}")]
    Sink(String),

    /// The pipeline was aborted after an unrecoverable failure.
    #[error("pipeline aborted")]
    Aborted,

    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
