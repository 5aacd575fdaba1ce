//! # Job Controller Tests
//!
//! Drive whole burn jobs against the simulated K6. Timeouts are shortened so
//! the retry paths finish in milliseconds.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use image::{DynamicImage, GrayImage, Luma};
use pretty_assertions::assert_eq;

use wainlux::config::Config;
use wainlux::device::{ConnectionState, OperationMode};
use wainlux::error::JobError;
use wainlux::events::{EventBus, Phase, ProgressEvent, Subscription};
use wainlux::job::{JobController, JobId, JobRequest};
use wainlux::protocol::commands::Opcode;
use wainlux::protocol::frame::FrameHeader;
use wainlux::transport::MockTransport;

// ============================================================================
// HELPERS
// ============================================================================

fn test_config() -> Config {
    let mut config = Config {
        port: "mock".to_string(),
        mock: true,
        ..Config::default()
    };
    config.timing.ack_timeout = Duration::from_millis(60);
    config.timing.connect_timeout = Duration::from_millis(60);
    config.timing.burn_idle_timeout = Duration::from_millis(150);
    config.timing.max_burn_duration = Duration::from_secs(5);
    config.retry.base_backoff = Duration::from_millis(1);
    config
}

fn controller_with(mock: MockTransport, config: Config) -> JobController {
    JobController::new(Arc::new(config), Box::new(mock), EventBus::new())
}

fn controller(mock: MockTransport) -> JobController {
    controller_with(mock, test_config())
}

fn black(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([0])))
}

/// Read events until the terminal one.
fn collect(sub: &mut Subscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.recv_timeout(Duration::from_secs(10)) {
        let done = event.is_terminal();
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Wire `mock` to cancel job `id` when `trigger` matches a written frame.
/// The controller must be placed in the returned slot before the job runs.
fn cancel_on<F>(
    mock: MockTransport,
    id: JobId,
    trigger: F,
) -> (MockTransport, Arc<OnceLock<JobController>>)
where
    F: Fn(&FrameHeader) -> bool + Send + 'static,
{
    let slot: Arc<OnceLock<JobController>> = Arc::new(OnceLock::new());
    let hook_slot = Arc::clone(&slot);
    let mock = mock.with_write_hook(move |header| {
        if trigger(header) {
            if let Some(controller) = hook_slot.get() {
                controller.cancel(id);
            }
        }
    });
    (mock, slot)
}

fn phases(events: &[ProgressEvent]) -> Vec<Phase> {
    let mut phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
    phases.dedup();
    phases
}

// ============================================================================
// END TO END
// ============================================================================

#[test]
fn test_black_square_burns_ten_lines() {
    let mock = MockTransport::new();
    let probe = mock.probe();
    let controller = controller(mock);

    let request = JobRequest::from_image(black(10, 10)).depth(100);
    let mut sub = controller.subscribe(request.id);
    let job = controller.run(request).unwrap();
    let events = collect(&mut sub);

    let lines: Vec<_> = probe.headers().into_iter().filter(|h| h.is_line()).collect();
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|h| h.depth == 100 && h.power == 1000));
    assert_eq!(probe.line_indices(), (0..10).collect::<Vec<u16>>());

    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Complete);
    assert_eq!(last.percent, 100);
    assert_eq!(job.phase, Phase::Complete);
    assert_eq!(job.raster.as_ref().unwrap().lines, 10);
    assert_eq!(probe.settle_violations(), 0);
    assert_eq!(probe.malformed(), 0);
}

#[test]
fn test_wire_sequence() {
    let mock = MockTransport::new();
    let probe = mock.probe();
    let controller = controller(mock);
    controller.run(JobRequest::from_image(black(8, 2))).unwrap();

    assert_eq!(
        probe.opcodes(),
        vec![
            Opcode::Status,
            Opcode::Framing,
            Opcode::JobHeader,
            Opcode::Line,
            Opcode::Line,
            Opcode::StartBurn,
            Opcode::Status,
            Opcode::Home,
        ]
    );
}

#[test]
fn test_event_stream_shape() {
    let controller = controller(MockTransport::new());
    let request = JobRequest::from_image(black(16, 4));
    let mut sub = controller.subscribe(request.id);
    controller.run(request).unwrap();
    let events = collect(&mut sub);

    assert_eq!(
        phases(&events),
        vec![
            Phase::Setup,
            Phase::Prepare,
            Phase::Connect,
            Phase::Upload,
            Phase::Burning,
            Phase::Wait,
            Phase::Finalize,
            Phase::Complete,
        ]
    );

    for pair in events.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
        if pair[0].phase == pair[1].phase {
            assert!(pair[1].percent >= pair[0].percent, "{:?}", pair);
        } else if !pair[1].phase.is_terminal() {
            assert_eq!(pair[1].percent, 0, "phase entry should reset: {:?}", pair[1]);
        }
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let upload_last = events
        .iter()
        .rev()
        .find(|e| e.phase == Phase::Upload)
        .unwrap();
    assert_eq!(upload_last.percent, 100);
}

#[test]
fn test_oversized_image_is_downscaled() {
    let controller = controller(MockTransport::new().with_ack_latency(Duration::from_millis(1)));
    let job = controller
        .run(JobRequest::from_image(black(2000, 1000)))
        .unwrap();
    let raster = job.raster.unwrap();
    assert!(raster.resized);
    assert_eq!((raster.width, raster.height), (1600, 800));
    assert_eq!(job.placement.unwrap().center_x, 800 + 67);
}

#[test]
fn test_undecodable_image_fails_before_connecting() {
    let mock = MockTransport::new();
    let probe = mock.probe();
    let controller = controller(mock);
    let request = JobRequest::from_bytes(b"not an image".to_vec());
    let mut sub = controller.subscribe(request.id);

    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Bounds(_)));
    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.error_kind.as_deref(), Some("bounds"));
    assert_eq!(probe.frame_count(), 0);
}

// ============================================================================
// RETRY
// ============================================================================

#[test]
fn test_dropped_acks_below_limit_complete() {
    let mock = MockTransport::new().with_dropped_acks(2);
    let probe = mock.probe();
    let controller = controller(mock);

    let job = controller.run(JobRequest::from_image(black(10, 10))).unwrap();
    assert_eq!(job.phase, Phase::Complete);
    assert_eq!(probe.dropped_acks(), 2);
    assert_eq!(probe.count(Opcode::Status), 4);
}

#[test]
fn test_dropped_line_acks_are_resent() {
    let mock = MockTransport::new().with_dropped_line_acks(4, 2);
    let probe = mock.probe();
    let controller = controller(mock);

    controller.run(JobRequest::from_image(black(10, 10))).unwrap();
    let fours = probe.line_indices().into_iter().filter(|i| *i == 4).count();
    assert_eq!(fours, 3);
    assert_eq!(probe.count(Opcode::Line), 12);
}

#[test]
fn test_dropped_acks_at_limit_fail_and_release() {
    let controller = controller(MockTransport::new().with_dropped_acks(3));
    let request = JobRequest::from_image(black(10, 10));
    let id = request.id;
    let mut sub = controller.subscribe(id);

    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::AckTimeout { attempts: 3, .. }));

    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.error_kind.as_deref(), Some("ack_timeout"));

    assert!(!controller.is_busy());
    let status = controller.status();
    assert_eq!(status.mode, OperationMode::Idle);
    assert_eq!(status.active_job, None);
    assert_eq!(controller.job(id).unwrap().error.unwrap().kind, "ack_timeout");

    // the device is usable again
    controller.run(JobRequest::from_image(black(4, 4))).unwrap();
}

#[test]
fn test_wrong_reply_below_limit_recovers() {
    let mock = MockTransport::new().with_wrong_line_acks(3, 0x42, 2);
    let probe = mock.probe();
    let controller = controller(mock);

    let job = controller.run(JobRequest::from_image(black(10, 10))).unwrap();
    assert_eq!(job.phase, Phase::Complete);
    let threes = probe.line_indices().into_iter().filter(|i| *i == 3).count();
    assert_eq!(threes, 3);
    assert_eq!(probe.count(Opcode::Line), 12);
}

#[test]
fn test_wrong_reply_at_limit_is_protocol_error() {
    let controller = controller(MockTransport::new().with_wrong_line_acks(3, 0x42, 3));
    let request = JobRequest::from_image(black(10, 10));
    let mut sub = controller.subscribe(request.id);

    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Protocol(_)));
    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.error_kind.as_deref(), Some("protocol"));
    assert!(!controller.is_busy());
}

#[test]
fn test_disconnect_mid_upload() {
    let controller = controller(MockTransport::new().disconnect_after(5));
    let err = controller
        .run(JobRequest::from_image(black(10, 10)))
        .unwrap_err();
    assert!(matches!(err, JobError::Disconnected));
    let status = controller.status();
    assert!(!status.connected);
    assert_eq!(status.state, ConnectionState::Error);
    assert!(!controller.is_busy());
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_after_three_lines_homes() {
    let request = JobRequest::from_image(black(10, 10));
    let id = request.id;
    let (mock, slot) = cancel_on(MockTransport::new(), id, |h| h.is_line() && h.line_index == 2);
    let probe = mock.probe();
    let controller = controller(mock);
    let _ = slot.set(controller.clone());

    let mut sub = controller.subscribe(id);
    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Cancelled));

    assert_eq!(probe.line_indices(), vec![0, 1, 2]);
    assert_eq!(probe.opcodes().last(), Some(&Opcode::Home));
    assert_eq!(probe.count(Opcode::StartBurn), 0);

    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.phase, Phase::Cancelled);
    assert_eq!(controller.job(id).unwrap().phase, Phase::Cancelled);
    assert!(!controller.is_busy());
}

#[test]
fn test_cancel_after_handshake_homes() {
    let request = JobRequest::from_image(black(10, 10));
    let id = request.id;
    let (mock, slot) = cancel_on(MockTransport::new(), id, |h| h.opcode == Opcode::Status);
    let probe = mock.probe();
    let controller = controller(mock);
    let _ = slot.set(controller.clone());

    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Cancelled));
    assert_eq!(probe.opcodes(), vec![Opcode::Status, Opcode::Home]);
    assert_eq!(controller.job(id).unwrap().phase, Phase::Cancelled);
}

#[test]
fn test_cancel_while_burning_stops_and_homes() {
    let request = JobRequest::from_image(black(4, 4));
    let id = request.id;
    let mock = MockTransport::new()
        .with_ack_latency(Duration::from_millis(10))
        .with_burn_progress(&[10, 20, 30, 40, 50, 60, 70, 80, 90, 100], Duration::from_millis(2));
    let (mock, slot) = cancel_on(mock, id, |h| h.opcode == Opcode::StartBurn);
    let probe = mock.probe();
    let controller = controller(mock);
    let _ = slot.set(controller.clone());

    let mut sub = controller.subscribe(id);
    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Cancelled));

    // each close-out frame acknowledged on its first attempt
    let opcodes = probe.opcodes();
    assert_eq!(
        &opcodes[opcodes.len() - 3..],
        &[Opcode::StartBurn, Opcode::Stop, Opcode::Home]
    );
    assert_eq!(probe.count(Opcode::Stop), 1);
    assert_eq!(probe.count(Opcode::Home), 1);
    assert_eq!(probe.settle_violations(), 0);

    assert_eq!(collect(&mut sub).pop().unwrap().phase, Phase::Cancelled);
    assert_eq!(controller.status().state, ConnectionState::Connected);
}

#[test]
fn test_failed_homing_after_cancel_is_the_outcome() {
    let request = JobRequest::from_image(black(10, 10));
    let id = request.id;
    // Status, Framing, JobHeader and lines 0..=2 go out; Home does not
    let mock = MockTransport::new().disconnect_after(6);
    let (mock, slot) = cancel_on(mock, id, |h| h.is_line() && h.line_index == 2);
    let controller = controller(mock);
    let _ = slot.set(controller.clone());

    let mut sub = controller.subscribe(id);
    let err = controller.run(request).unwrap_err();
    assert!(matches!(err, JobError::Disconnected));

    let last = collect(&mut sub).pop().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.error_kind.as_deref(), Some("disconnected"));
    assert_eq!(controller.status().state, ConnectionState::Error);
    assert!(!controller.is_busy());
}

#[test]
fn test_cancel_unknown_job_is_ignored() {
    let controller = controller(MockTransport::new());
    assert!(!controller.cancel(uuid::Uuid::new_v4()));
}

// ============================================================================
// EXCLUSIVITY
// ============================================================================

#[test]
fn test_second_submission_is_busy() {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);

    let mock = MockTransport::new().with_write_hook(move |header| {
        if header.is_line() && header.line_index == 0 {
            let _ = entered_tx.send(());
            let rx = release_rx.lock().unwrap();
            let _ = rx.recv_timeout(Duration::from_secs(5));
        }
    });
    let controller = controller(mock);

    let first = controller
        .submit(JobRequest::from_image(black(10, 10)))
        .unwrap();
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let second = JobRequest::from_image(black(10, 10));
    let second_id = second.id;
    assert!(matches!(controller.submit(second), Err(JobError::Busy)));
    assert!(controller.job(second_id).is_none());
    assert!(matches!(controller.home(), Err(JobError::Busy)));

    // status reads do not wait for the job
    let status = controller.status();
    assert_eq!(status.mode, OperationMode::Burning);
    assert_eq!(status.active_job, Some(first.id()));
    assert_eq!(controller.job(first.id()).unwrap().phase, Phase::Upload);

    release_tx.send(()).unwrap();
    let job = first.wait().unwrap();
    assert_eq!(job.phase, Phase::Complete);
}

#[test]
fn test_status_is_idempotent_when_disconnected() {
    let mock = MockTransport::new();
    let probe = mock.probe();
    let controller = controller(mock);

    let before = controller.status();
    let again = controller.status();
    assert_eq!(before, again);
    assert!(!before.connected);
    assert_eq!(before.state, ConnectionState::Disconnected);
    assert!(before.mock);
    assert!(!before.dry_run);
    assert!(!probe.is_open());
    assert_eq!(probe.frame_count(), 0);
}

// ============================================================================
// BURN PHASE
// ============================================================================

#[test]
fn test_silent_device_past_half_counts_as_done() {
    let mock = MockTransport::new().with_burn_progress(&[20, 60], Duration::from_millis(5));
    let controller = controller(mock);
    let job = controller.run(JobRequest::from_image(black(4, 4))).unwrap();
    assert_eq!(job.phase, Phase::Complete);
}

#[test]
fn test_silent_device_early_is_incomplete() {
    let mock = MockTransport::new().with_burn_progress(&[10, 30], Duration::from_millis(5));
    let controller = controller(mock);
    let err = controller
        .run(JobRequest::from_image(black(4, 4)))
        .unwrap_err();
    assert!(matches!(err, JobError::BurnIncomplete { last_percent: 30 }));
}

// ============================================================================
// DRY RUN
// ============================================================================

#[test]
fn test_dry_run_never_touches_transport() {
    let mock = MockTransport::new();
    let probe = mock.probe();
    let config = Config {
        dry_run: true,
        ..test_config()
    };
    let controller = controller_with(mock, config);

    let request = JobRequest::from_image(black(10, 10));
    let mut sub = controller.subscribe(request.id);
    let job = controller.run(request).unwrap();
    let events = collect(&mut sub);

    assert_eq!(job.phase, Phase::Complete);
    assert_eq!(probe.frame_count(), 0);
    assert!(!probe.is_open());
    assert_eq!(
        phases(&events),
        vec![
            Phase::Setup,
            Phase::Prepare,
            Phase::Connect,
            Phase::Upload,
            Phase::Burning,
            Phase::Wait,
            Phase::Finalize,
            Phase::Complete,
        ]
    );
    assert!(controller.status().dry_run);
}
