//! Pipeline assembly and lifecycle.
//!
//! [`ConversionPipeline::start`] wires the capture source, the flow
//! gate, the converter device, and the completion dispatch together,
//! then spawns the pump thread. [`ConversionPipeline::join`] waits for
//! the stream to end (or fail) and tears the converter down.

pub mod flow;

mod dispatch;
mod pump;

use crate::converter::{ConverterDevice, MemoryMode, PlaneKind};
use crate::error::{Error, Result};
use crate::format::{MemoryLayout, PixelFormat, Resolution};
use crate::sink::FrameSink;
use crate::source::FrameSource;
use dispatch::CompletionDispatcher;
use flow::FlowGate;
use pump::FramePump;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Configuration for a conversion pipeline.
///
/// Constructed once and passed to [`ConversionPipeline::start`]; every
/// component reads from the same object, there is no global state.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frame resolution, identical on both planes.
    pub resolution: Resolution,
    /// Pixel format the capture source exports.
    pub input_format: PixelFormat,
    /// Memory layout of exported source images.
    pub input_layout: MemoryLayout,
    /// Pixel format the converter emits.
    pub result_format: PixelFormat,
    /// Memory layout of converted output.
    pub result_layout: MemoryLayout,
    /// Input-plane pool size.
    pub input_buffers: u32,
    /// Result-plane ring size (independent of the input pool).
    pub result_buffers: u32,
    /// Maximum frames in flight through the converter (backpressure
    /// limit).
    pub pending_ceiling: usize,
    /// Bounded wait for one frame from the capture source.
    pub frame_timeout: Duration,
    /// Bounded wait for the result plane to drain at shutdown.
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(640, 480),
            input_format: PixelFormat::I420,
            input_layout: MemoryLayout::BlockLinear,
            result_format: PixelFormat::Rgba,
            result_layout: MemoryLayout::Pitch,
            input_buffers: 10,
            result_buffers: 10,
            pending_ceiling: 4,
            frame_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Set the frame resolution.
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the input-plane pixel format and layout.
    pub fn with_input_format(mut self, format: PixelFormat, layout: MemoryLayout) -> Self {
        self.input_format = format;
        self.input_layout = layout;
        self
    }

    /// Set the result-plane pixel format and layout.
    pub fn with_result_format(mut self, format: PixelFormat, layout: MemoryLayout) -> Self {
        self.result_format = format;
        self.result_layout = layout;
        self
    }

    /// Set the per-plane buffer counts.
    pub fn with_buffers(mut self, input: u32, result: u32) -> Self {
        self.input_buffers = input;
        self.result_buffers = result;
        self
    }

    /// Set the pending-frame ceiling.
    pub fn with_pending_ceiling(mut self, ceiling: usize) -> Self {
        self.pending_ceiling = ceiling;
        self
    }

    /// Set the bounded frame-acquire wait.
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Set the bounded shutdown drain wait.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.resolution.is_valid() {
            return Err(Error::Config(format!(
                "resolution {} has a zero dimension",
                self.resolution
            )));
        }
        if self.input_buffers == 0 || self.result_buffers == 0 {
            return Err(Error::Config("plane buffer counts must be non-zero".into()));
        }
        if self.pending_ceiling == 0 {
            return Err(Error::Config("pending ceiling must be at least 1".into()));
        }
        if self.pending_ceiling > self.input_buffers as usize {
            return Err(Error::Config(format!(
                "pending ceiling {} exceeds input pool of {}",
                self.pending_ceiling, self.input_buffers
            )));
        }
        Ok(())
    }
}

/// Pipeline counters, updated atomically by the pump and the
/// completion dispatch.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Frames submitted to the converter's input plane.
    pub frames_submitted: AtomicU64,
    /// Converted frames delivered to the sink.
    pub frames_delivered: AtomicU64,
    /// Input buffers returned to the ready queue.
    pub buffers_recycled: AtomicU64,
    /// Zero-byte completions observed (either plane).
    pub empty_completions: AtomicU64,
}

impl PipelineStats {
    /// Take a consistent-enough snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            buffers_recycled: self.buffers_recycled.load(Ordering::Relaxed),
            empty_completions: self.empty_completions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames submitted to the converter's input plane.
    pub frames_submitted: u64,
    /// Converted frames delivered to the sink.
    pub frames_delivered: u64,
    /// Input buffers returned to the ready queue.
    pub buffers_recycled: u64,
    /// Zero-byte completions observed (either plane).
    pub empty_completions: u64,
}

/// A running conversion pipeline.
///
/// Owns the pump thread and the shared state; the converter's notifier
/// threads are owned by the device but bound to this pipeline's
/// dispatcher. Dropping the handle aborts the pipeline and joins the
/// pump.
pub struct ConversionPipeline {
    gate: Arc<FlowGate>,
    device: Arc<dyn ConverterDevice>,
    stats: Arc<PipelineStats>,
    worker: Option<thread::JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for ConversionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPipeline")
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl ConversionPipeline {
    /// Configure the converter, seed the buffer pools, start streaming,
    /// and spawn the pump.
    ///
    /// Construction is all-or-nothing: the first failing setup step
    /// aborts the device and returns the error naming that step; no
    /// partially started pipeline is left running.
    pub fn start(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        device: Arc<dyn ConverterDevice>,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        config.validate()?;
        match Self::bring_up(&config, source, &device, sink) {
            Ok(pipeline) => Ok(pipeline),
            Err(e) => {
                // Tear down whatever was already configured so the
                // device does not keep notifier threads or streaming
                // planes alive.
                device.abort();
                Err(e)
            }
        }
    }

    fn bring_up(
        config: &PipelineConfig,
        source: Box<dyn FrameSource>,
        device: &Arc<dyn ConverterDevice>,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self> {
        tracing::info!(
            resolution = %config.resolution,
            input = %config.input_format,
            result = %config.result_format,
            ceiling = config.pending_ceiling,
            "starting conversion pipeline"
        );

        device.set_input_format(config.input_format, config.resolution, config.input_layout)?;
        device.set_result_format(
            config.result_format,
            config.resolution,
            config.result_layout,
        )?;

        let input_pool = device.setup_plane(
            PlaneKind::Input,
            MemoryMode::Import,
            config.input_buffers,
            false,
            false,
        )?;
        let result_ring = device.setup_plane(
            PlaneKind::Result,
            MemoryMode::Mapped,
            config.result_buffers,
            true,
            false,
        )?;

        let gate = Arc::new(FlowGate::new(config.pending_ceiling));
        gate.seed(input_pool);

        // The result ring must be fully queued (empty) before streaming
        // starts, or the device stalls with no completions.
        for buffer in result_ring {
            device.submit(PlaneKind::Result, buffer)?;
        }

        device.set_streaming(PlaneKind::Input, true)?;
        device.set_streaming(PlaneKind::Result, true)?;

        let stats = Arc::new(PipelineStats::default());
        let dispatcher = Arc::new(CompletionDispatcher::new(
            Arc::clone(&gate),
            Arc::clone(device),
            sink,
            Arc::clone(&stats),
        ));
        device.start_notifiers(dispatcher)?;

        let pump = FramePump::new(
            Arc::clone(&gate),
            Arc::clone(device),
            source,
            Arc::clone(&stats),
            config.resolution,
            config.input_format,
            config.input_layout,
            config.frame_timeout,
            config.drain_timeout,
        );
        let worker = thread::Builder::new()
            .name("prism-pump".into())
            .spawn(move || pump.run())
            .map_err(Error::Io)?;

        Ok(Self {
            gate,
            device: Arc::clone(device),
            stats,
            worker: Some(worker),
        })
    }

    /// Wait for the pump to finish, stop streaming, and return the
    /// pipeline outcome.
    pub fn join(mut self) -> Result<()> {
        let outcome = match self.worker.take() {
            Some(worker) => worker
                .join()
                .unwrap_or_else(|_| Err(Error::Device("frame pump panicked".into()))),
            None => Ok(()),
        };
        self.teardown();
        outcome
    }

    /// Abort the pipeline: latch the failure flag and release the
    /// converter so every blocked stage unwinds.
    pub fn abort(&self) {
        self.gate.fail();
        self.device.abort();
    }

    /// Whether the pipeline has observed an unrecoverable failure.
    pub fn is_failed(&self) -> bool {
        self.gate.is_failed()
    }

    /// Snapshot of the pipeline counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current number of frames in flight through the converter.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Current number of input buffers sitting in the ready queue.
    pub fn ready_buffers(&self) -> usize {
        self.gate.ready_len()
    }

    fn teardown(&self) {
        for plane in [PlaneKind::Input, PlaneKind::Result] {
            if let Err(e) = self.device.set_streaming(plane, false) {
                tracing::warn!(plane = plane.as_str(), %e, "failed to stop streaming");
            }
        }
    }
}

impl Drop for ConversionPipeline {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Never leave the pump running past the handle.
            self.gate.fail();
            self.device.abort();
            let _ = worker.join();
            self.teardown();
        }
    }
}
