//! In-process test doubles for the pipeline's external collaborators.
//!
//! These run the pipeline end-to-end without hardware: a scripted
//! capture source, a loopback converter that honors the two-plane
//! contract (own submit queues, own notification threads, abort
//! semantics), and a collecting sink. They are used by the integration
//! tests and are handy for exercising downstream code against a
//! deterministic pipeline.

use crate::buffer::{ExternalHandle, ExternalImage, TransferBuffer};
use crate::converter::{
    Completion, CompletionHandler, ConverterDevice, MemoryMode, NotifierFlow, PlaneKind,
};
use crate::error::{Error, Result};
use crate::format::{MemoryLayout, PixelFormat, Resolution};
use crate::sink::FrameSink;
use crate::source::{CaptureFrame, FrameSource};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// TestFrameSource
// ============================================================================

/// An exported test image; dropping it counts as releasing the
/// external resource.
#[derive(Debug)]
struct TestImage {
    released: Arc<AtomicUsize>,
}

impl ExternalImage for TestImage {}

impl Drop for TestImage {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestFrame {
    released: Arc<AtomicUsize>,
    fail_export: bool,
}

impl CaptureFrame for TestFrame {
    fn export(
        self: Box<Self>,
        _resolution: Resolution,
        _format: PixelFormat,
        _layout: MemoryLayout,
    ) -> Result<ExternalHandle> {
        if self.fail_export {
            return Err(Error::Export("scripted export failure".into()));
        }
        Ok(Box::new(TestImage {
            released: Arc::clone(&self.released),
        }))
    }
}

/// A scripted capture source producing a fixed number of frames.
///
/// Optionally times out or fails an export at a scripted position, to
/// drive the pipeline's fatal paths.
pub struct TestFrameSource {
    total_frames: u64,
    produced: u64,
    timeout_at: Option<u64>,
    fail_export_at: Option<u64>,
    released: Arc<AtomicUsize>,
}

impl TestFrameSource {
    /// Produce `total_frames` frames, then report end of stream.
    pub fn new(total_frames: u64) -> Self {
        Self {
            total_frames,
            produced: 0,
            timeout_at: None,
            fail_export_at: None,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Time out (instead of producing) once `frames` frames were
    /// produced.
    pub fn timeout_after(mut self, frames: u64) -> Self {
        self.timeout_at = Some(frames);
        self
    }

    /// Fail the export of the frame at position `frame`.
    pub fn fail_export_at(mut self, frame: u64) -> Self {
        self.fail_export_at = Some(frame);
        self
    }

    /// Counter of exported images released so far; clone before
    /// handing the source to the pipeline.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for TestFrameSource {
    fn wait_until_connected(&mut self) -> Result<()> {
        Ok(())
    }

    fn acquire_frame(&mut self, timeout: Duration) -> Result<Option<Box<dyn CaptureFrame>>> {
        if self.timeout_at == Some(self.produced) {
            return Err(Error::FrameTimeout(timeout));
        }
        if self.produced >= self.total_frames {
            return Ok(None);
        }
        let fail_export = self.fail_export_at == Some(self.produced);
        self.produced += 1;
        Ok(Some(Box::new(TestFrame {
            released: Arc::clone(&self.released),
            fail_export,
        })))
    }
}

// ============================================================================
// CollectSink
// ============================================================================

/// Shape of one frame as seen by [`CollectSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectedFrame {
    /// Pixel payload length in bytes.
    pub len: usize,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
}

/// A sink that records every consumed frame's shape.
pub struct CollectSink {
    frames: Arc<Mutex<Vec<CollectedFrame>>>,
}

impl CollectSink {
    /// Create a collecting sink.
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of the collected frames; clone before handing the
    /// sink to the pipeline.
    pub fn frames(&self) -> Arc<Mutex<Vec<CollectedFrame>>> {
        Arc::clone(&self.frames)
    }
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for CollectSink {
    fn consume(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<()> {
        self.frames.lock().unwrap().push(CollectedFrame {
            len: pixels.len(),
            width,
            height,
        });
        Ok(())
    }
}

// ============================================================================
// LoopbackConverter
// ============================================================================

#[derive(Default)]
struct DeviceState {
    input_format: Option<(PixelFormat, Resolution, MemoryLayout)>,
    result_format: Option<(PixelFormat, Resolution, MemoryLayout)>,
    input_streaming: bool,
    result_streaming: bool,
}

struct Pending {
    count: usize,
}

/// Everything the notifier threads share with the device handle.
struct ConvInner {
    state: Mutex<DeviceState>,
    aborted: AtomicBool,

    input_tx: kanal::Sender<TransferBuffer>,
    input_rx: kanal::Receiver<TransferBuffer>,
    free_tx: kanal::Sender<TransferBuffer>,
    free_rx: kanal::Receiver<TransferBuffer>,
    done_tx: kanal::Sender<TransferBuffer>,
    done_rx: kanal::Receiver<TransferBuffer>,

    pending: Mutex<Pending>,
    drained: Condvar,

    /// Input submissions still accepted before `submit(Input, ..)`
    /// starts failing; negative = never fail.
    fail_submit_after: AtomicI64,
    /// Result completions delivered cleanly before one is flagged as
    /// an error; negative = never.
    error_result_after: AtomicI64,
    /// Artificial per-frame conversion latency.
    convert_delay: Duration,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    conversions: AtomicUsize,
}

impl ConvInner {
    fn pending_inc(&self) {
        self.pending.lock().unwrap().count += 1;
    }

    fn pending_dec(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.count = pending.count.saturating_sub(1);
        if pending.count == 0 {
            self.drained.notify_all();
        }
    }

    fn close_channels(&self) {
        self.input_tx.close();
        self.free_tx.close();
        self.done_tx.close();
    }

    /// Input-plane notifier: dequeues submitted source buffers, runs
    /// the "conversion" into a free result buffer, and reports the
    /// input completion.
    fn input_notifier(&self, handler: &dyn CompletionHandler) {
        while let Ok(mut input) = self.input_rx.recv() {
            if !self.convert_delay.is_zero() {
                thread::sleep(self.convert_delay);
            }

            let Ok(mut result) = self.free_rx.recv() else {
                break;
            };

            // The conversion itself: stamp the mapped result storage
            // with a recognizable pattern.
            let seq = self.conversions.fetch_add(1, Ordering::SeqCst);
            for plane in result.planes_mut() {
                let len = match plane.data_mut() {
                    Some(data) => {
                        data.fill(seq as u8);
                        data.len() as u32
                    }
                    None => 0,
                };
                plane.bytes_used = len;
            }

            let index = input.index();
            let bytes = input.bytes_used();
            input.clear_payload();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let flow = handler.input_done(Some(Completion::ok(index, bytes)), input);
            if flow == NotifierFlow::Stop {
                break;
            }

            if self.done_tx.send(result).is_err() {
                break;
            }
        }
        tracing::debug!("loopback input notifier exited");
    }

    /// Result-plane notifier: delivers converted buffers to the
    /// handler, which recirculates them via `submit(Result, ..)`.
    fn result_notifier(&self, handler: &dyn CompletionHandler) {
        let mut delivered: i64 = 0;
        while let Ok(buffer) = self.done_rx.recv() {
            let index = buffer.index();
            let entry = if self.error_result_after.load(Ordering::SeqCst) == delivered {
                Completion::failed(index)
            } else {
                Completion::ok(index, buffer.bytes_used())
            };
            delivered += 1;

            let flow = handler.result_done(Some(entry), buffer);
            self.pending_dec();
            if flow == NotifierFlow::Stop {
                break;
            }
        }
        tracing::debug!("loopback result notifier exited");
    }
}

/// A software stand-in for the two-plane hardware converter.
///
/// Honors the device contract the pipeline relies on: independent
/// per-plane queues, one completion-notification thread per plane,
/// result-ring recirculation, and abort releasing every blocked
/// thread. The "conversion" fills result buffers with a counter
/// pattern. Failure-injection knobs drive the pipeline's fatal paths
/// from tests.
pub struct LoopbackConverter {
    inner: Arc<ConvInner>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl LoopbackConverter {
    /// Create a loopback converter with no failure injection.
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// Create a loopback converter that takes `convert_delay` per
    /// frame, making backpressure observable.
    pub fn with_delay(convert_delay: Duration) -> Arc<Self> {
        let (input_tx, input_rx) = kanal::bounded(256);
        let (free_tx, free_rx) = kanal::bounded(256);
        let (done_tx, done_rx) = kanal::bounded(256);
        Arc::new(Self {
            inner: Arc::new(ConvInner {
                state: Mutex::new(DeviceState::default()),
                aborted: AtomicBool::new(false),
                input_tx,
                input_rx,
                free_tx,
                free_rx,
                done_tx,
                done_rx,
                pending: Mutex::new(Pending { count: 0 }),
                drained: Condvar::new(),
                fail_submit_after: AtomicI64::new(-1),
                error_result_after: AtomicI64::new(-1),
                convert_delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                conversions: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Reject input submissions after accepting `count` of them.
    pub fn fail_submit_after(&self, count: i64) {
        self.inner.fail_submit_after.store(count, Ordering::SeqCst);
    }

    /// Flag the result completion after `count` clean deliveries as a
    /// device error.
    pub fn error_result_after(&self, count: i64) {
        self.inner.error_result_after.store(count, Ordering::SeqCst);
    }

    /// Highest number of input submissions observed concurrently
    /// pending (the device-side view of the in-flight ceiling).
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total conversions performed.
    pub fn conversions(&self) -> usize {
        self.inner.conversions.load(Ordering::SeqCst)
    }

    /// Whether the device was aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }
}

impl ConverterDevice for LoopbackConverter {
    fn set_input_format(
        &self,
        format: PixelFormat,
        resolution: Resolution,
        layout: MemoryLayout,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.input_format.is_some() {
            return Err(Error::Setup("input format already fixed".into()));
        }
        state.input_format = Some((format, resolution, layout));
        Ok(())
    }

    fn set_result_format(
        &self,
        format: PixelFormat,
        resolution: Resolution,
        layout: MemoryLayout,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.result_format.is_some() {
            return Err(Error::Setup("result format already fixed".into()));
        }
        state.result_format = Some((format, resolution, layout));
        Ok(())
    }

    fn setup_plane(
        &self,
        plane: PlaneKind,
        memory: MemoryMode,
        count: u32,
        _export_handles: bool,
        _allow_duplication: bool,
    ) -> Result<Vec<TransferBuffer>> {
        let state = self.inner.state.lock().unwrap();
        let (format, resolution) = match plane {
            PlaneKind::Input => state
                .input_format
                .map(|(f, r, _)| (f, r))
                .ok_or_else(|| Error::Setup("input format not set before plane setup".into()))?,
            PlaneKind::Result => state
                .result_format
                .map(|(f, r, _)| (f, r))
                .ok_or_else(|| Error::Setup("result format not set before plane setup".into()))?,
        };
        let buffers = (0..count)
            .map(|i| match memory {
                MemoryMode::Import => TransferBuffer::imported(i, format, resolution),
                MemoryMode::Mapped => TransferBuffer::mapped(i, format, resolution),
            })
            .collect();
        Ok(buffers)
    }

    fn set_streaming(&self, plane: PlaneKind, on: bool) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match plane {
            PlaneKind::Input => state.input_streaming = on,
            PlaneKind::Result => state.result_streaming = on,
        }
        drop(state);
        if !on {
            // Stopping either plane closes its queues; both notifiers
            // unwind once their receive sides run dry.
            self.inner.close_channels();
        }
        Ok(())
    }

    fn start_notifiers(&self, handler: Arc<dyn CompletionHandler>) -> Result<()> {
        let mut threads = self.threads.lock().unwrap();

        let inner = Arc::clone(&self.inner);
        let input_handler = Arc::clone(&handler);
        threads.push(
            thread::Builder::new()
                .name("loopback-input-dq".into())
                .spawn(move || inner.input_notifier(input_handler.as_ref()))
                .map_err(Error::Io)?,
        );

        let inner = Arc::clone(&self.inner);
        threads.push(
            thread::Builder::new()
                .name("loopback-result-dq".into())
                .spawn(move || inner.result_notifier(handler.as_ref()))
                .map_err(Error::Io)?,
        );
        Ok(())
    }

    fn submit(&self, plane: PlaneKind, buffer: TransferBuffer) -> Result<()> {
        let inner = &self.inner;
        if inner.aborted.load(Ordering::SeqCst) {
            return Err(Error::Submit {
                plane: plane.as_str(),
                reason: "device aborted".into(),
            });
        }
        match plane {
            PlaneKind::Input => {
                if !inner.state.lock().unwrap().input_streaming {
                    return Err(Error::Submit {
                        plane: plane.as_str(),
                        reason: "plane is not streaming".into(),
                    });
                }
                if inner.fail_submit_after.fetch_sub(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Submit {
                        plane: plane.as_str(),
                        reason: "scripted submission failure".into(),
                    });
                }
                let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
                inner.pending_inc();
                inner.input_tx.send(buffer).map_err(|_| Error::Submit {
                    plane: plane.as_str(),
                    reason: "input queue closed".into(),
                })
            }
            // The empty result ring may be queued before streaming
            // starts; that is how the device avoids stalling.
            PlaneKind::Result => inner.free_tx.send(buffer).map_err(|_| Error::Submit {
                plane: plane.as_str(),
                reason: "result queue closed".into(),
            }),
        }
    }

    fn wait_drained(&self, _plane: PlaneKind, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.inner.pending.lock().unwrap();
        while pending.count > 0 {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, wait) = self.inner.drained.wait_timeout(pending, remaining).unwrap();
            pending = guard;
            if wait.timed_out() && pending.count > 0 {
                return false;
            }
        }
        true
    }

    fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.close_channels();
        // Nothing will complete past this point; release drain waiters.
        let mut pending = self.inner.pending.lock().unwrap();
        pending.count = 0;
        self.inner.drained.notify_all();
    }
}

impl Drop for LoopbackConverter {
    fn drop(&mut self) {
        self.inner.close_channels();
        let current = thread::current().id();
        for handle in self.threads.lock().unwrap().drain(..) {
            // The final device reference can be dropped by a notifier
            // thread on its way out; it must not join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
