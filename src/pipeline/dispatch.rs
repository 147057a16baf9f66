//! Completion dispatch for the converter's notification threads.
//!
//! One [`CompletionDispatcher`] serves both planes. It is the Rust
//! shape of the device's per-plane dequeue callbacks: a handler bound
//! to the pipeline's shared gate, device handle, sink, and counters,
//! rather than free functions casting an opaque context pointer.

use crate::buffer::TransferBuffer;
use crate::converter::{Completion, CompletionHandler, ConverterDevice, NotifierFlow, PlaneKind};
use crate::error::Error;
use crate::pipeline::flow::FlowGate;
use crate::pipeline::PipelineStats;
use crate::sink::FrameSink;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Handler for both planes' completion notifications.
pub(crate) struct CompletionDispatcher {
    gate: Arc<FlowGate>,
    device: Arc<dyn ConverterDevice>,
    /// The sink is only ever called from the result-plane notifier, but
    /// the handler itself is shared; the mutex is uncontended.
    sink: Mutex<Box<dyn FrameSink>>,
    stats: Arc<PipelineStats>,
}

impl CompletionDispatcher {
    pub(crate) fn new(
        gate: Arc<FlowGate>,
        device: Arc<dyn ConverterDevice>,
        sink: Box<dyn FrameSink>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            gate,
            device,
            sink: Mutex::new(sink),
            stats,
        }
    }

    /// Latch the failure, release the device, and stop this notifier.
    ///
    /// Failure order matters: the flag is set first so every waiter
    /// that the device abort releases observes Abort instead of
    /// re-blocking.
    fn fatal(&self, plane: PlaneKind, error: &Error) -> NotifierFlow {
        tracing::error!(plane = plane.as_str(), %error, "completion dispatch failed");
        self.gate.fail();
        self.device.abort();
        NotifierFlow::Stop
    }

    /// Validate a dequeued entry; `None` is indistinguishable from a
    /// device-flagged error.
    fn check_entry(&self, plane: PlaneKind, entry: Option<Completion>) -> Result<Completion, Error> {
        match entry {
            Some(completion) if completion.error => Err(Error::Device(format!(
                "{plane} plane flagged completion of buffer {} as failed",
                completion.index
            ))),
            Some(completion) => Ok(completion),
            None => Err(Error::Device(format!(
                "{plane} plane returned a malformed completion"
            ))),
        }
    }
}

impl CompletionHandler for CompletionDispatcher {
    fn input_done(&self, entry: Option<Completion>, mut buffer: TransferBuffer) -> NotifierFlow {
        let completion = match self.check_entry(PlaneKind::Input, entry) {
            Ok(c) => c,
            Err(e) => return self.fatal(PlaneKind::Input, &e),
        };

        if completion.bytes_used == 0 {
            // Early/flush completion carrying no frame; nothing was
            // consumed, so neither the in-flight count nor the ready
            // queue changes.
            self.stats.empty_completions.fetch_add(1, Ordering::Relaxed);
            return NotifierFlow::Continue;
        }

        // The exported frame memory is released here; the buffer itself
        // goes back into rotation.
        drop(buffer.take_handle());
        buffer.clear_payload();
        tracing::trace!(
            index = buffer.index(),
            in_flight = self.gate.in_flight(),
            "input buffer recycled"
        );
        self.gate.recycle(buffer);
        self.stats.buffers_recycled.fetch_add(1, Ordering::Relaxed);
        NotifierFlow::Continue
    }

    fn result_done(&self, entry: Option<Completion>, mut buffer: TransferBuffer) -> NotifierFlow {
        let completion = match self.check_entry(PlaneKind::Result, entry) {
            Ok(c) => c,
            Err(e) => return self.fatal(PlaneKind::Result, &e),
        };

        if completion.bytes_used == 0 {
            self.stats.empty_completions.fetch_add(1, Ordering::Relaxed);
            return NotifierFlow::Continue;
        }

        let plane = &buffer.planes()[0];
        let (width, height) = (plane.width, plane.height);
        let consumed = match plane.data() {
            Some(pixels) => self.sink.lock().unwrap().consume(pixels, width, height),
            None => Err(Error::Device(
                "result buffer carries no mapped storage".into(),
            )),
        };
        if let Err(e) = consumed {
            return self.fatal(PlaneKind::Result, &e);
        }
        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);

        // Requeue the (now logically empty) buffer so the result ring
        // stays populated.
        buffer.clear_payload();
        if let Err(e) = self.device.submit(PlaneKind::Result, buffer) {
            return self.fatal(PlaneKind::Result, &e);
        }
        NotifierFlow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MemoryMode;
    use crate::error::Result;
    use crate::format::{MemoryLayout, PixelFormat, Resolution};
    use crate::buffer::ExternalImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Records aborts and result-plane resubmissions.
    #[derive(Default)]
    struct FakeDevice {
        aborted: AtomicBool,
        resubmitted: Mutex<Vec<u32>>,
    }

    impl ConverterDevice for FakeDevice {
        fn set_input_format(
            &self,
            _format: PixelFormat,
            _resolution: Resolution,
            _layout: MemoryLayout,
        ) -> Result<()> {
            Ok(())
        }

        fn set_result_format(
            &self,
            _format: PixelFormat,
            _resolution: Resolution,
            _layout: MemoryLayout,
        ) -> Result<()> {
            Ok(())
        }

        fn setup_plane(
            &self,
            _plane: PlaneKind,
            _memory: MemoryMode,
            _count: u32,
            _export_handles: bool,
            _allow_duplication: bool,
        ) -> Result<Vec<TransferBuffer>> {
            Ok(Vec::new())
        }

        fn set_streaming(&self, _plane: PlaneKind, _on: bool) -> Result<()> {
            Ok(())
        }

        fn start_notifiers(&self, _handler: Arc<dyn CompletionHandler>) -> Result<()> {
            Ok(())
        }

        fn submit(&self, plane: PlaneKind, buffer: TransferBuffer) -> Result<()> {
            assert_eq!(plane, PlaneKind::Result);
            self.resubmitted.lock().unwrap().push(buffer.index());
            Ok(())
        }

        fn wait_drained(&self, _plane: PlaneKind, _timeout: Duration) -> bool {
            true
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct TrackedImage(Arc<AtomicUsize>);

    impl ExternalImage for TrackedImage {}

    impl Drop for TrackedImage {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountSink(Arc<AtomicUsize>);

    impl FrameSink for CountSink {
        fn consume(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectSink;

    impl FrameSink for RejectSink {
        fn consume(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<()> {
            Err(Error::Sink("refused".into()))
        }
    }

    fn harness(
        sink: Box<dyn FrameSink>,
    ) -> (
        CompletionDispatcher,
        Arc<FlowGate>,
        Arc<FakeDevice>,
        Arc<PipelineStats>,
    ) {
        let gate = Arc::new(FlowGate::new(3));
        let device = Arc::new(FakeDevice::default());
        let stats = Arc::new(PipelineStats::default());
        let dispatcher = CompletionDispatcher::new(
            Arc::clone(&gate),
            Arc::<FakeDevice>::clone(&device) as Arc<dyn ConverterDevice>,
            sink,
            Arc::clone(&stats),
        );
        (dispatcher, gate, device, stats)
    }

    fn input_buffer(index: u32) -> TransferBuffer {
        TransferBuffer::imported(index, PixelFormat::I420, Resolution::new(64, 48))
    }

    fn result_buffer(index: u32) -> TransferBuffer {
        TransferBuffer::mapped(index, PixelFormat::Rgba, Resolution::new(64, 48))
    }

    #[test]
    fn test_zero_byte_input_completion_mutates_nothing() {
        let (dispatcher, gate, device, stats) = harness(count_sink());
        gate.seed(vec![input_buffer(1)]);
        let held = gate.acquire().unwrap();

        let flow = dispatcher.input_done(Some(Completion::ok(0, 0)), input_buffer(0));
        assert_eq!(flow, NotifierFlow::Continue);
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.ready_len(), 0);
        assert!(!device.aborted.load(Ordering::SeqCst));
        assert_eq!(stats.empty_completions.load(Ordering::SeqCst), 1);
        drop(held);
    }

    #[test]
    fn test_zero_byte_result_completion_mutates_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _gate, device, stats) =
            harness(Box::new(CountSink(Arc::clone(&counter))));

        let flow = dispatcher.result_done(Some(Completion::ok(0, 0)), result_buffer(0));
        assert_eq!(flow, NotifierFlow::Continue);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(device.resubmitted.lock().unwrap().is_empty());
        assert_eq!(stats.empty_completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_input_completion_releases_handle_and_recycles() {
        let (dispatcher, gate, _device, stats) = harness(count_sink());
        gate.seed(vec![input_buffer(7)]);
        let mut held = gate.acquire().unwrap();

        let drops = Arc::new(AtomicUsize::new(0));
        held.attach_handle(Box::new(TrackedImage(Arc::clone(&drops))));
        held.mark_populated();

        let flow = dispatcher.input_done(Some(Completion::ok(7, 1)), held);
        assert_eq!(flow, NotifierFlow::Continue);
        assert_eq!(drops.load(Ordering::SeqCst), 1, "external image released");
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.ready_len(), 1);
        assert_eq!(stats.buffers_recycled.load(Ordering::SeqCst), 1);

        let recycled = gate.acquire().unwrap();
        assert_eq!(recycled.index(), 7);
        assert_eq!(recycled.bytes_used(), 0, "payload stamp cleared");
        assert!(!recycled.has_handle());
    }

    #[test]
    fn test_result_completion_forwards_and_resubmits() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (dispatcher, _gate, device, stats) =
            harness(Box::new(CountSink(Arc::clone(&counter))));

        let size = PixelFormat::Rgba.frame_size(Resolution::new(64, 48)) as u32;
        let flow = dispatcher.result_done(Some(Completion::ok(2, size)), result_buffer(2));
        assert_eq!(flow, NotifierFlow::Continue);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*device.resubmitted.lock().unwrap(), vec![2]);
        assert_eq!(stats.frames_delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_entry_is_fatal_on_both_planes() {
        for result_plane in [false, true] {
            let (dispatcher, gate, device, _stats) = harness(count_sink());
            let flow = if result_plane {
                dispatcher.result_done(None, result_buffer(0))
            } else {
                dispatcher.input_done(None, input_buffer(0))
            };
            assert_eq!(flow, NotifierFlow::Stop);
            assert!(gate.is_failed());
            assert!(device.aborted.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_error_flagged_entry_is_fatal() {
        let (dispatcher, gate, device, _stats) = harness(count_sink());
        let flow = dispatcher.input_done(Some(Completion::failed(0)), input_buffer(0));
        assert_eq!(flow, NotifierFlow::Stop);
        assert!(gate.is_failed());
        assert!(device.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sink_error_is_fatal() {
        let (dispatcher, gate, device, _stats) = harness(Box::new(RejectSink));
        let size = PixelFormat::Rgba.frame_size(Resolution::new(64, 48)) as u32;
        let flow = dispatcher.result_done(Some(Completion::ok(0, size)), result_buffer(0));
        assert_eq!(flow, NotifierFlow::Stop);
        assert!(gate.is_failed());
        assert!(device.aborted.load(Ordering::SeqCst));
        assert!(device.resubmitted.lock().unwrap().is_empty());
    }

    /// Counting sink for tests where the count is irrelevant.
    fn count_sink() -> Box<dyn FrameSink> {
        Box::new(CountSink(Arc::new(AtomicUsize::new(0))))
    }
}
