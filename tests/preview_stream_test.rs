//! Preview frame delivery, backpressure and device interruption.

mod common;

use camcore::config::Backpressure;
use camcore::permissions::FixedPermissions;
use camcore::{Camera, CameraError, CameraEvent, PixelFormat, SessionState};
use common::{eventually, low_settings, rig, rig_with};
use std::sync::atomic::Ordering;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

/// Drain every queued event.
async fn drain(events: &camcore::EventChannel) -> Vec<CameraEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.poll_event().await {
        all.push(event);
    }
    all
}

#[tokio::test]
async fn test_preview_delivers_ordered_frames() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    assert!(!camera.is_previewing());
    camera.start_preview().await.unwrap();
    assert!(camera.is_previewing());

    let mut last = None;
    for _ in 0..5 {
        let frame = handler.recv_frame_timeout(WAIT).await.expect("frame");
        assert_eq!((frame.width, frame.height), (352, 288));
        assert_eq!(frame.device_id, "synthetic-back");
        assert_eq!(frame.data.len(), 352 * 288 * 3);
        if let Some(previous) = last {
            assert!(frame.sequence > previous);
        }
        last = Some(frame.sequence);
    }

    camera.stop_preview().await.unwrap();
    assert!(!camera.is_previewing());
    let events = drain(&camera.events()).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, CameraEvent::FrameAvailable { width: 352, .. })));
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_start_preview_is_idempotent() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();

    camera.start_preview().await.unwrap();
    camera.start_preview().await.unwrap();
    assert_eq!(rig.backend.counters().stream_starts.load(Ordering::SeqCst), 1);

    camera.stop_preview().await.unwrap();
    camera.stop_preview().await.unwrap();
    // Stopping preview keeps the session (and the indicator) running.
    assert_eq!(camera.state().await.unwrap(), SessionState::Running);
    assert!(rig.backend.counters().indicator_on.load(Ordering::SeqCst));
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_no_frames_after_stop_preview() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    handler.recv_frame_timeout(WAIT).await.expect("frame");
    camera.stop_preview().await.unwrap();

    while handler.next_frame(Duration::ZERO).unwrap().is_some() {}
    let frames = rig.backend.counters().frames.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.backend.counters().frames.load(Ordering::SeqCst), frames);
    assert!(handler.recv_frame_timeout(Duration::from_millis(50)).await.is_none());
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_consumer_drops_oldest() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    assert!(eventually(WAIT, || handler.dropped_frames() > 0).await);
    camera.stop_preview().await.unwrap();

    assert!(handler.buffered() <= 2);
    let events = drain(&camera.events()).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, CameraEvent::StreamDegraded { dropped } if *dropped > 0)));
    // Drops are not errors.
    assert!(!events
        .iter()
        .any(|e| matches!(e, CameraEvent::DeviceError { .. })));
    assert_eq!(camera.state().await.unwrap(), SessionState::Running);
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_blocking_policy_never_drops() {
    let rig = rig_with(FixedPermissions::authorized(), |c| {
        c.stream.backpressure = Backpressure::Block;
        c.stream.buffer_capacity = 2;
    })
    .unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    assert!(eventually(WAIT, || handler.buffered() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.dropped_frames(), 0);
    assert_eq!(handler.buffered(), 2);

    // Consuming unblocks the producer.
    let first = handler.recv_frame_timeout(WAIT).await.unwrap();
    let second = handler.recv_frame_timeout(WAIT).await.unwrap();
    let third = handler.recv_frame_timeout(WAIT).await.unwrap();
    assert_eq!(second.sequence, first.sequence + 1);
    assert_eq!(third.sequence, second.sequence + 1);

    // A blocked producer still stops promptly.
    camera.stop_preview().await.unwrap();
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_bgra_stream_conversion() {
    let rig = rig().unpaced();
    let settings = low_settings().with_stream_pixel_format(PixelFormat::Bgra32);
    let camera = Camera::open("synthetic-back", settings, rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    let frame = handler.recv_frame_timeout(WAIT).await.expect("frame");
    assert_eq!(frame.pixel_format, PixelFormat::Bgra32);
    assert_eq!(frame.data.len(), 352 * 288 * 4);
    assert!(frame.data.chunks_exact(4).all(|px| px[3] == 255));
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_frames_carry_orientation_and_mirroring() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-front", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    let frame = handler.recv_frame_timeout(WAIT).await.expect("frame");
    assert!(frame.mirrored);
    assert_eq!(frame.rotation_degrees, 90);

    camera
        .set_orientation(camcore::DeviceOrientation::LandscapeRight)
        .await
        .unwrap();
    while handler.next_frame(Duration::ZERO).unwrap().is_some() {}
    let rotated = eventually(WAIT, || {
        matches!(
            handler.next_frame(Duration::from_millis(20)),
            Ok(Some(f)) if f.rotation_degrees == 180
        )
    })
    .await;
    assert!(rotated);
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    let err = camera.pause_preview().unwrap_err();
    assert!(matches!(err, CameraError::InvalidSessionState(_)));

    camera.start_preview().await.unwrap();
    handler.recv_frame_timeout(WAIT).await.expect("frame");
    camera.pause_preview().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frames = rig.backend.counters().frames.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.backend.counters().frames.load(Ordering::SeqCst), frames);

    camera.resume_preview().unwrap();
    while handler.next_frame(Duration::ZERO).unwrap().is_some() {}
    handler.recv_frame_timeout(WAIT).await.expect("frame after resume");
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_interruption_stops_session() {
    let rig = rig().unpaced();
    rig.backend
        .faults()
        .interrupt_after_frames
        .store(3, Ordering::SeqCst);
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let events = camera.events();

    camera.start_preview().await.unwrap();

    let mut interrupted = false;
    while let Some(event) = events.wait_for_event_timeout(WAIT).await {
        if let CameraEvent::SessionInterrupted { message } = event {
            assert!(message.contains("synthetic-back"));
            interrupted = true;
            break;
        }
    }
    assert!(interrupted, "expected a SessionInterrupted event");

    let mut state = camera.state().await.unwrap();
    for _ in 0..100 {
        if state == SessionState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = camera.state().await.unwrap();
    }
    assert_eq!(state, SessionState::Stopped);
    assert!(!rig.backend.counters().indicator_on.load(Ordering::SeqCst));

    // The pump is gone, so preview calls must say so instead of succeeding.
    assert!(!camera.is_previewing());
    assert!(matches!(
        camera.pause_preview(),
        Err(CameraError::InvalidSessionState(_))
    ));
    assert!(matches!(
        camera.start_preview().await,
        Err(CameraError::InvalidSessionState(_))
    ));
    assert!(!camera.is_previewing());
    camera.stop_preview().await.unwrap();

    let err = camera.take_picture().await.unwrap_err();
    assert!(matches!(err, CameraError::InvalidSessionState(_)));
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_unread_events_do_not_pile_up() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();
    let events = camera.events();
    camera.start_preview().await.unwrap();

    let mut frames = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    while tokio::time::Instant::now() < deadline {
        if handler.recv_frame_timeout(WAIT).await.is_some() {
            frames += 1;
        }
    }
    camera.stop_preview().await.unwrap();

    assert!(frames > 10, "only {frames} frames delivered");
    assert!(
        events.pending() <= camcore::stream::EVENT_CAPACITY,
        "{} events queued after {frames} frames",
        events.pending()
    );
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_close_while_previewing() {
    let rig = rig().unpaced();
    let camera = Camera::open("synthetic-back", low_settings(), rig.env.clone())
        .await
        .unwrap();
    let handler = camera.stream_handler();

    camera.start_preview().await.unwrap();
    handler.recv_frame_timeout(WAIT).await.expect("frame");
    camera.close().await.unwrap();

    assert!(!camera.is_previewing());
    assert!(handler.is_closed());
    assert!(!rig.backend.counters().indicator_on.load(Ordering::SeqCst));
}
