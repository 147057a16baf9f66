//! # Prism
//!
//! A bounded-memory frame-conversion pipeline for hardware two-plane
//! converter devices.
//!
//! Prism moves video frames from a capture source, through an
//! asynchronous hardware-backed format converter, to a downstream
//! consumer, with a fixed buffer pool and explicit backpressure. The
//! converter is modeled after memory-to-memory devices that expose two
//! independent planes (an input plane that ingests source pixels and a
//! result plane that emits converted pixels), each with its own submit
//! queue and its own completion-notification thread.
//!
//! ## Architecture
//!
//! - A worker thread pumps frames from a [`source::FrameSource`] into
//!   the converter's input plane, gated by a fixed pool of
//!   [`buffer::TransferBuffer`]s and a pending-frame ceiling.
//! - The converter's input-plane notifier returns spent buffers to the
//!   pool; its result-plane notifier hands converted pixels to a
//!   [`sink::FrameSink`] and requeues the result buffer.
//! - All stages are OS threads; the only synchronization between the
//!   worker and the completion path is one mutex + condvar pair.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use prism::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::default().with_resolution(Resolution::new(640, 480));
//! let device: Arc<dyn ConverterDevice> = open_converter()?;
//! let pipeline = ConversionPipeline::start(config, source, device, Box::new(sink))?;
//! pipeline.join()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod converter;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod testing;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{ExternalHandle, TransferBuffer};
    pub use crate::converter::{Completion, ConverterDevice, PlaneKind};
    pub use crate::error::{Error, Result};
    pub use crate::format::{MemoryLayout, PixelFormat, Resolution};
    pub use crate::pipeline::{ConversionPipeline, PipelineConfig};
    pub use crate::sink::FrameSink;
    pub use crate::source::{CaptureFrame, FrameSource};
}

pub use error::{Error, Result};
