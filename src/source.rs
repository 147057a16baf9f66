//! Capture source interface.
//!
//! The pipeline treats the camera stack as an external collaborator:
//! session negotiation, capture-request submission, and device
//! discovery all live behind [`FrameSource`]. The pipeline only needs
//! three things from it: wait for the producer to connect, lease one
//! frame at a time with a bounded wait, and export a leased frame's
//! image as an external memory handle.

use crate::buffer::ExternalHandle;
use crate::error::Result;
use crate::format::{MemoryLayout, PixelFormat, Resolution};
use std::time::Duration;

/// One captured frame, leased from a [`FrameSource`].
///
/// The lease is exclusive to the worker until the frame is exported;
/// [`export`](CaptureFrame::export) consumes the frame, returning it to
/// the source immediately while the exported handle lives on until the
/// converter's input-plane completion releases it.
pub trait CaptureFrame: Send {
    /// Export the frame's image as an external memory handle in the
    /// given resolution, pixel format, and layout.
    fn export(
        self: Box<Self>,
        resolution: Resolution,
        format: PixelFormat,
        layout: MemoryLayout,
    ) -> Result<ExternalHandle>;
}

/// A connected capture stream the pipeline pulls frames from.
pub trait FrameSource: Send {
    /// Block until the producer side of the stream has connected.
    fn wait_until_connected(&mut self) -> Result<()>;

    /// Acquire the next frame, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the stream is exhausted (clean end of
    /// stream). A timeout surfaces as
    /// [`Error::FrameTimeout`](crate::Error::FrameTimeout) and is
    /// treated as fatal by the pipeline: there is no retry policy.
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<Box<dyn CaptureFrame>>>;
}
