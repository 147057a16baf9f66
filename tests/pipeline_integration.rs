//! End-to-end pipeline tests against the loopback converter.
//!
//! These exercise the full thread topology: the pump thread, both
//! notifier threads, and the caller performing setup/teardown. They
//! verify steady-state delivery, backpressure, failure propagation,
//! and teardown invariants.

use prism::converter::ConverterDevice;
use prism::format::{PixelFormat, Resolution};
use prism::pipeline::{ConversionPipeline, PipelineConfig};
use prism::testing::{CollectSink, LoopbackConverter, TestFrameSource};
use prism::Error;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `predicate` until it holds, panicking after a few seconds.
fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if std::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_resolution(Resolution::new(64, 48))
        .with_buffers(6, 6)
        .with_pending_ceiling(3)
        .with_frame_timeout(Duration::from_secs(1))
        .with_drain_timeout(Duration::from_secs(1))
}

#[test]
fn delivers_every_frame_to_the_sink() {
    init_tracing();
    let device = LoopbackConverter::new();
    let source = TestFrameSource::new(25);
    let released = source.release_counter();
    let sink = CollectSink::new();
    let frames = sink.frames();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    pipeline.join().unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 25);
    let expected_len = PixelFormat::Rgba.frame_size(Resolution::new(64, 48));
    for frame in frames.iter() {
        assert_eq!(frame.len, expected_len);
        assert_eq!((frame.width, frame.height), (64, 48));
    }
    assert_eq!(device.conversions(), 25);
    assert_eq!(
        released.load(Ordering::SeqCst),
        25,
        "every exported image released"
    );
    assert!(!device.is_aborted());
}

#[test]
fn stats_account_for_every_frame() {
    init_tracing();
    let device = LoopbackConverter::new();
    let source = TestFrameSource::new(10);
    let sink = CollectSink::new();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    // Wait for the stream to run dry, then check the counters line up.
    wait_until(|| pipeline.stats().frames_delivered == 10);
    let stats = pipeline.stats();
    assert_eq!(stats.frames_submitted, 10);
    assert_eq!(stats.frames_delivered, 10);
    wait_until(|| pipeline.stats().buffers_recycled == 10);

    pipeline.join().unwrap();
    assert_eq!(device.conversions(), 10);
}

#[test]
fn backpressure_never_exceeds_ceiling() {
    init_tracing();
    let device = LoopbackConverter::with_delay(Duration::from_millis(2));
    let source = TestFrameSource::new(40);
    let sink = CollectSink::new();
    let frames = sink.frames();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();
    pipeline.join().unwrap();

    assert_eq!(frames.lock().unwrap().len(), 40);
    assert!(
        device.max_in_flight() <= 3,
        "device observed {} concurrent frames, ceiling is 3",
        device.max_in_flight()
    );
    // With a slow converter the pump should actually reach the limit.
    assert!(device.max_in_flight() >= 2);
}

#[test]
fn pool_is_intact_after_clean_shutdown() {
    init_tracing();
    let device = LoopbackConverter::new();
    let source = TestFrameSource::new(12);
    let sink = CollectSink::new();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    // After a clean run every input buffer is back in the ready queue
    // and nothing is in flight.
    wait_until(|| pipeline.in_flight() == 0 && pipeline.ready_buffers() == 6);
    assert!(!pipeline.is_failed());

    pipeline.join().unwrap();
    assert!(!device.is_aborted());
}

#[test]
fn submit_failure_aborts_the_pipeline() {
    init_tracing();
    let device = LoopbackConverter::new();
    device.fail_submit_after(4);
    let source = TestFrameSource::new(100);
    let sink = CollectSink::new();
    let frames = sink.frames();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    let outcome = pipeline.join();
    assert!(matches!(outcome, Err(Error::Submit { .. })), "{outcome:?}");
    assert!(device.is_aborted());
    assert!(frames.lock().unwrap().len() <= 4);
}

#[test]
fn frame_timeout_is_fatal() {
    init_tracing();
    let device = LoopbackConverter::new();
    let source = TestFrameSource::new(100).timeout_after(5);
    let sink = CollectSink::new();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    let outcome = pipeline.join();
    assert!(
        matches!(outcome, Err(Error::FrameTimeout(_))),
        "{outcome:?}"
    );
    assert!(device.is_aborted());
}

#[test]
fn export_failure_is_fatal() {
    init_tracing();
    let device = LoopbackConverter::new();
    let source = TestFrameSource::new(100).fail_export_at(3);
    let sink = CollectSink::new();

    let pipeline = ConversionPipeline::start(
        test_config(),
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    let outcome = pipeline.join();
    assert!(matches!(outcome, Err(Error::Export(_))), "{outcome:?}");
    assert!(device.is_aborted());
}

#[test]
fn error_completion_unblocks_the_pump() {
    init_tracing();
    let device = LoopbackConverter::with_delay(Duration::from_millis(1));
    device.error_result_after(6);
    let source = TestFrameSource::new(10_000);
    let sink = CollectSink::new();
    let frames = sink.frames();

    let config = test_config().with_drain_timeout(Duration::from_millis(50));
    let pipeline = ConversionPipeline::start(
        config,
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    // The pump must observe the abort and stop rather than hang on a
    // gate that will never refill.
    let outcome = pipeline.join();
    assert!(outcome.is_err(), "{outcome:?}");
    assert!(device.is_aborted());
    assert_eq!(frames.lock().unwrap().len(), 6);
}

#[test]
fn invalid_config_is_rejected_before_setup() {
    init_tracing();
    let device = LoopbackConverter::new();

    let config = test_config().with_pending_ceiling(0);
    let outcome = ConversionPipeline::start(
        config,
        Box::new(TestFrameSource::new(1)),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(CollectSink::new()),
    );
    assert!(matches!(outcome, Err(Error::Config(_))));

    let config = test_config().with_buffers(2, 6).with_pending_ceiling(3);
    let outcome = ConversionPipeline::start(
        config,
        Box::new(TestFrameSource::new(1)),
        device as Arc<dyn ConverterDevice>,
        Box::new(CollectSink::new()),
    );
    assert!(matches!(outcome, Err(Error::Config(_))));
}

#[test]
fn setup_failure_aborts_construction() {
    init_tracing();
    let device = LoopbackConverter::new();
    // Fixing the format twice is a setup error; the second start must
    // fail cleanly and leave nothing running.
    device
        .set_input_format(
            PixelFormat::I420,
            Resolution::new(64, 48),
            Default::default(),
        )
        .unwrap();

    let outcome = ConversionPipeline::start(
        test_config(),
        Box::new(TestFrameSource::new(1)),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(CollectSink::new()),
    );
    assert!(matches!(outcome, Err(Error::Setup(_))), "{outcome:?}");
    assert!(device.is_aborted());
}

#[test]
fn abort_stops_a_running_pipeline() {
    init_tracing();
    let device = LoopbackConverter::with_delay(Duration::from_millis(1));
    let source = TestFrameSource::new(u64::MAX);
    let sink = CollectSink::new();

    let config = test_config().with_drain_timeout(Duration::from_millis(50));
    let pipeline = ConversionPipeline::start(
        config,
        Box::new(source),
        device.clone() as Arc<dyn ConverterDevice>,
        Box::new(sink),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    pipeline.abort();
    assert!(pipeline.is_failed());

    let outcome = pipeline.join();
    assert!(outcome.is_err(), "{outcome:?}");
}
