//! The modeled hardware conversion device.
//!
//! A converter is an asynchronous memory-to-memory device with two
//! independent planes:
//!
//! - the **input plane** ingests source pixels (bound via external
//!   memory handles), and
//! - the **result plane** emits converted pixels into device-mapped
//!   buffers.
//!
//! Each plane has its own submit queue and its own
//! completion-notification thread. Completions are delivered to a
//! single [`CompletionHandler`] bound to the pipeline's shared state;
//! the handler's return value tells the notifier thread whether to keep
//! dequeueing.
//!
//! ## Lifecycle
//!
//! Formats and plane pools are fixed once configured. Result-plane
//! buffers must all be submitted (empty) before streaming starts, or
//! the device stalls with no completions. Both planes must be streaming
//! before input submissions, and are explicitly stopped at teardown.
//! [`abort`](ConverterDevice::abort) releases both planes from any
//! blocking state after an unrecoverable failure.

use crate::buffer::TransferBuffer;
use crate::error::Result;
use crate::format::{MemoryLayout, PixelFormat, Resolution};
use std::sync::Arc;
use std::time::Duration;

/// One direction of dataflow through the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// Ingests source pixels.
    Input,
    /// Emits converted pixels.
    Result,
}

impl PlaneKind {
    /// Static name, for error messages and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Result => "result",
        }
    }
}

impl std::fmt::Display for PlaneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a plane's buffers bind their memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMode {
    /// Buffers import external memory handles (no host mapping).
    Import,
    /// Buffers are device-allocated and mapped for host access.
    Mapped,
}

/// A dequeued completion entry.
///
/// Notifiers pass `None` instead of a `Completion` when the dequeue
/// itself failed or returned a malformed entry; handlers must treat
/// that identically to `error == true`.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Pool index of the completed buffer.
    pub index: u32,
    /// Bytes the device consumed or produced; zero marks a benign
    /// early/flush completion carrying no data.
    pub bytes_used: u32,
    /// Whether the device flagged this completion as failed.
    pub error: bool,
}

impl Completion {
    /// A successful completion for `index` carrying `bytes_used` bytes.
    pub fn ok(index: u32, bytes_used: u32) -> Self {
        Self {
            index,
            bytes_used,
            error: false,
        }
    }

    /// A device-flagged error completion.
    pub fn failed(index: u32) -> Self {
        Self {
            index,
            bytes_used: 0,
            error: true,
        }
    }
}

/// Whether a notifier thread should keep dequeueing after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierFlow {
    /// Keep dequeueing completions.
    Continue,
    /// Stop this notifier thread.
    Stop,
}

/// Receiver for plane completions.
///
/// One handler instance serves both planes; its methods are invoked
/// concurrently with each other and with the worker, each from its
/// plane's notification thread. Ownership of the completed buffer
/// transfers to the handler.
pub trait CompletionHandler: Send + Sync {
    /// An input-plane submission completed; the source pixels have been
    /// consumed and `buffer` is spent.
    fn input_done(&self, entry: Option<Completion>, buffer: TransferBuffer) -> NotifierFlow;

    /// A result-plane buffer completed; `buffer` carries converted
    /// pixels.
    fn result_done(&self, entry: Option<Completion>, buffer: TransferBuffer) -> NotifierFlow;
}

/// The two-plane hardware conversion device.
///
/// All methods take `&self`; implementations guard their own state, as
/// submissions and control calls arrive from multiple pipeline threads.
pub trait ConverterDevice: Send + Sync {
    /// Fix the input plane's pixel format, resolution, and layout.
    fn set_input_format(
        &self,
        format: PixelFormat,
        resolution: Resolution,
        layout: MemoryLayout,
    ) -> Result<()>;

    /// Fix the result plane's pixel format, resolution, and layout.
    fn set_result_format(
        &self,
        format: PixelFormat,
        resolution: Resolution,
        layout: MemoryLayout,
    ) -> Result<()>;

    /// Allocate a plane's buffer pool and return the buffers.
    ///
    /// `export_handles` asks the device to export its buffers for
    /// host access; `allow_duplication` permits the device to hand out
    /// duplicated descriptors where the underlying API requires it.
    fn setup_plane(
        &self,
        plane: PlaneKind,
        memory: MemoryMode,
        count: u32,
        export_handles: bool,
        allow_duplication: bool,
    ) -> Result<Vec<TransferBuffer>>;

    /// Start or stop streaming on a plane.
    fn set_streaming(&self, plane: PlaneKind, on: bool) -> Result<()>;

    /// Spawn the per-plane completion-notification threads, delivering
    /// completions to `handler` until it returns
    /// [`NotifierFlow::Stop`] or the device is torn down.
    fn start_notifiers(&self, handler: Arc<dyn CompletionHandler>) -> Result<()>;

    /// Enqueue a buffer on a plane's send side.
    fn submit(&self, plane: PlaneKind, buffer: TransferBuffer) -> Result<()>;

    /// Wait (bounded) for a plane's pending completions to drain.
    ///
    /// Returns `true` if the plane drained within `timeout`.
    fn wait_drained(&self, plane: PlaneKind, timeout: Duration) -> bool;

    /// Release both planes from any blocking state and stop accepting
    /// submissions; notification threads unwind.
    fn abort(&self);
}
