//! The frame pump: capture source → converter input plane.
//!
//! One dedicated OS thread runs [`FramePump::run`], the steady-state
//! loop that leases frames from the capture source, exports their
//! images, and submits them to the converter, gated by the buffer pool
//! and the pending-frame ceiling.

use crate::converter::{ConverterDevice, PlaneKind};
use crate::error::{Error, Result};
use crate::format::{MemoryLayout, PixelFormat, Resolution};
use crate::pipeline::flow::FlowGate;
use crate::pipeline::PipelineStats;
use crate::source::FrameSource;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct FramePump {
    gate: Arc<FlowGate>,
    device: Arc<dyn ConverterDevice>,
    source: Box<dyn FrameSource>,
    stats: Arc<PipelineStats>,
    resolution: Resolution,
    input_format: PixelFormat,
    input_layout: MemoryLayout,
    frame_timeout: Duration,
    drain_timeout: Duration,
}

impl FramePump {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        gate: Arc<FlowGate>,
        device: Arc<dyn ConverterDevice>,
        source: Box<dyn FrameSource>,
        stats: Arc<PipelineStats>,
        resolution: Resolution,
        input_format: PixelFormat,
        input_layout: MemoryLayout,
        frame_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            device,
            source,
            stats,
            resolution,
            input_format,
            input_layout,
            frame_timeout,
            drain_timeout,
        }
    }

    /// Run the pump to completion: until the source is exhausted or the
    /// pipeline fails.
    pub(crate) fn run(mut self) -> Result<()> {
        tracing::debug!("waiting for capture stream to connect");
        if let Err(e) = self.source.wait_until_connected() {
            return Err(self.fatal(e));
        }
        tracing::debug!("capture stream connected, pumping");

        let outcome = self.pump_loop();

        // Let the result plane finish delivering whatever the converter
        // already holds before the pipeline is declared stopped; a
        // stuck device must not hang shutdown.
        if !self
            .device
            .wait_drained(PlaneKind::Result, self.drain_timeout)
        {
            tracing::warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "result plane did not drain before shutdown"
            );
        }

        match &outcome {
            Ok(()) => tracing::debug!(
                frames = self.stats.frames_submitted.load(Ordering::Relaxed),
                "frame pump finished"
            ),
            Err(e) => tracing::error!(%e, "frame pump aborted"),
        }
        outcome
    }

    fn pump_loop(&mut self) -> Result<()> {
        loop {
            let mut buffer = match self.gate.acquire() {
                Ok(buffer) => buffer,
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => return Err(self.fatal(e)),
            };

            let frame = match self.source.acquire_frame(self.frame_timeout) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // Clean end of stream: hand the reserved buffer
                    // back before leaving.
                    self.gate.recycle(buffer);
                    tracing::debug!("capture stream exhausted");
                    return Ok(());
                }
                Err(e) => return Err(self.fatal(e)),
            };

            let handle =
                match frame.export(self.resolution, self.input_format, self.input_layout) {
                    Ok(handle) => handle,
                    Err(e) => return Err(self.fatal(e)),
                };

            buffer.attach_handle(handle);
            // The converter skips buffers whose planes report zero
            // bytes, so stamp a token length before queueing.
            buffer.mark_populated();

            let index = buffer.index();
            if let Err(e) = self.device.submit(PlaneKind::Input, buffer) {
                return Err(self.fatal(e));
            }
            self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                index,
                in_flight = self.gate.in_flight(),
                "frame submitted"
            );
        }
    }

    /// Latch the failure and release the converter, then hand the error
    /// back to the caller.
    fn fatal(&self, error: Error) -> Error {
        self.gate.fail();
        self.device.abort();
        error
    }
}
