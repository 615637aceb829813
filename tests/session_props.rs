//! Property-based tests for the capture session graph.
//!
//! These verify the configuration lock contract: graph mutations only inside
//! an open configuration, rollback when a configuration is abandoned, and
//! idempotent start/stop.

use camcore::platform::SyntheticBackend;
use camcore::session::{CaptureConnection, CaptureOutput, OutputId};
use camcore::testing::{back_camera, front_camera};
use camcore::{CameraError, CaptureSession, MediaSettings, ResolutionPreset, SessionState};
use proptest::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum GraphOp {
    AddInput { front: bool },
    RemoveInput,
    AddPhoto,
    AddVideo,
    RemoveOutput(u32),
    Connect(u32),
    SetPreset(ResolutionPreset),
}

fn graph_op() -> impl Strategy<Value = GraphOp> {
    prop_oneof![
        any::<bool>().prop_map(|front| GraphOp::AddInput { front }),
        Just(GraphOp::RemoveInput),
        Just(GraphOp::AddPhoto),
        Just(GraphOp::AddVideo),
        (0u32..6).prop_map(GraphOp::RemoveOutput),
        (0u32..6).prop_map(GraphOp::Connect),
        prop_oneof![
            Just(ResolutionPreset::Low),
            Just(ResolutionPreset::High),
            Just(ResolutionPreset::Max),
        ]
        .prop_map(GraphOp::SetPreset),
    ]
}

fn apply(session: &mut CaptureSession, op: &GraphOp) -> Result<(), CameraError> {
    match op {
        GraphOp::AddInput { front } => {
            let device = if *front { front_camera() } else { back_camera() };
            let format = MediaSettings::new(ResolutionPreset::Low).resolve(&device)?;
            session.add_input(device, format)
        }
        GraphOp::RemoveInput => session.remove_input(),
        GraphOp::AddPhoto => session.add_output(CaptureOutput::photo()).map(|_| ()),
        GraphOp::AddVideo => session.add_output(CaptureOutput::video_data()).map(|_| ()),
        GraphOp::RemoveOutput(id) => session.remove_output(OutputId(*id)),
        GraphOp::Connect(id) => session.add_connection(OutputId(*id)).map(|_| ()),
        GraphOp::SetPreset(preset) => session.set_preset(*preset),
    }
}

type GraphView = (
    Option<String>,
    Vec<(OutputId, CaptureOutput)>,
    Vec<CaptureConnection>,
    ResolutionPreset,
);

fn view(session: &CaptureSession) -> GraphView {
    (
        session.input().map(|i| i.device.id.clone()),
        session.outputs().map(|(id, o)| (id, o.clone())).collect(),
        session.connections().cloned().collect(),
        session.preset(),
    )
}

fn new_session() -> (CaptureSession, Arc<SyntheticBackend>) {
    let backend = Arc::new(SyntheticBackend::with_default_devices());
    backend.faults().unpaced.store(true, Ordering::SeqCst);
    (CaptureSession::new(backend.clone()), backend)
}

/// Input, photo and video outputs, both connected, committed.
fn configured_session() -> (CaptureSession, Arc<SyntheticBackend>) {
    let (mut session, backend) = new_session();
    {
        let mut config = session.begin_configuration().unwrap();
        let device = back_camera();
        let format = MediaSettings::new(ResolutionPreset::Low)
            .resolve(&device)
            .unwrap();
        config.set_preset(ResolutionPreset::Low).unwrap();
        config.add_input(device, format).unwrap();
        let photo = config.add_output(CaptureOutput::photo()).unwrap();
        let video = config.add_output(CaptureOutput::video_data()).unwrap();
        config.add_connection(photo).unwrap();
        config.add_connection(video).unwrap();
        config.commit().unwrap();
    }
    (session, backend)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// INVARIANT: outside a configuration every graph mutation is rejected
    /// with InvalidSessionState and leaves the graph untouched.
    #[test]
    fn mutations_outside_configuration_rejected(
        ops in prop::collection::vec(graph_op(), 1..12),
        running in any::<bool>(),
    ) {
        let (mut session, _backend) = configured_session();
        if running {
            session.start_running().unwrap();
        }
        let state = session.state();
        let before = view(&session);

        for op in &ops {
            let result = apply(&mut session, op);
            prop_assert!(
                matches!(result, Err(CameraError::InvalidSessionState(_))),
                "{:?} outside configuration gave {:?}", op, result
            );
        }
        prop_assert_eq!(view(&session), before);
        prop_assert_eq!(session.state(), state);
    }

    /// INVARIANT: a configuration dropped without commit restores the graph
    /// and state in effect before it began, whatever it did meanwhile.
    #[test]
    fn abandoned_configuration_rolls_back(
        ops in prop::collection::vec(graph_op(), 0..12),
        running in any::<bool>(),
    ) {
        let (mut session, backend) = configured_session();
        if running {
            session.start_running().unwrap();
        }
        let state = session.state();
        let before = view(&session);
        let opens = backend.counters().opens.load(Ordering::SeqCst);

        {
            let mut config = session.begin_configuration().unwrap();
            prop_assert_eq!(config.session().state(), SessionState::Configuring);
            for op in &ops {
                let _ = match op {
                    GraphOp::AddInput { front } => {
                        let device = if *front { front_camera() } else { back_camera() };
                        let format = MediaSettings::new(ResolutionPreset::Low)
                            .resolve(&device)
                            .unwrap();
                        config.add_input(device, format)
                    }
                    GraphOp::RemoveInput => config.remove_input(),
                    GraphOp::AddPhoto => config.add_output(CaptureOutput::photo()).map(|_| ()),
                    GraphOp::AddVideo => config.add_output(CaptureOutput::video_data()).map(|_| ()),
                    GraphOp::RemoveOutput(id) => config.remove_output(OutputId(*id)),
                    GraphOp::Connect(id) => config.add_connection(OutputId(*id)).map(|_| ()),
                    GraphOp::SetPreset(preset) => config.set_preset(*preset),
                };
            }
        }

        prop_assert_eq!(view(&session), before);
        prop_assert_eq!(session.state(), state);
        prop_assert_eq!(backend.counters().opens.load(Ordering::SeqCst), opens);
        prop_assert_eq!(session.stats().commits, 1);
    }

    /// INVARIANT: start/stop are idempotent; only real transitions count.
    #[test]
    fn start_stop_idempotent(ops in prop::collection::vec(any::<bool>(), 1..20)) {
        let (mut session, backend) = configured_session();
        let mut running = false;
        let mut starts = 0u64;
        let mut stops = 0u64;

        for start in ops {
            if start {
                session.start_running().unwrap();
                if !running {
                    starts += 1;
                    running = true;
                }
            } else {
                session.stop_running().unwrap();
                if running {
                    stops += 1;
                    running = false;
                }
            }
            prop_assert_eq!(
                backend.counters().indicator_on.load(Ordering::SeqCst),
                running
            );
        }

        let stats = session.stats();
        prop_assert_eq!(stats.starts, starts);
        prop_assert_eq!(stats.stops, stops);
        prop_assert_eq!(
            backend.counters().stream_starts.load(Ordering::SeqCst) as u64,
            starts
        );
    }
}

#[test]
fn test_configuration_lock_released_on_drop() {
    let (mut session, _backend) = configured_session();
    let config = session.begin_configuration().unwrap();
    drop(config);
    // Dropping the guard releases the lock.
    assert!(session.begin_configuration().is_ok());
}

#[test]
fn test_start_requires_committed_input() {
    let (mut session, backend) = new_session();
    let err = session.start_running().unwrap_err();
    assert!(matches!(err, CameraError::InvalidSessionState(_)));
    assert!(!backend.counters().hardware_touched());
}

#[test]
fn test_commit_while_running_swaps_device() {
    let (mut session, backend) = configured_session();
    session.start_running().unwrap();

    {
        let mut config = session.begin_configuration().unwrap();
        config.remove_input().unwrap();
        let device = front_camera();
        let format = MediaSettings::new(ResolutionPreset::Low)
            .resolve(&device)
            .unwrap();
        config.add_input(device, format).unwrap();
        let photo = config.add_output(CaptureOutput::photo()).unwrap();
        config.add_connection(photo).unwrap();
        config.commit().unwrap();
    }

    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.input().unwrap().device.id, "synthetic-front");
    assert_eq!(backend.counters().opens.load(Ordering::SeqCst), 2);
    // New stream started before the old one was released.
    assert_eq!(backend.counters().stream_starts.load(Ordering::SeqCst), 2);
    assert_eq!(backend.counters().stream_stops.load(Ordering::SeqCst), 1);
    assert!(session.connections().all(|c| c.mirrored));
}

#[test]
fn test_commit_rejects_input_outside_preset() {
    let (mut session, backend) = configured_session();
    session.start_running().unwrap();
    let before = view(&session);

    {
        let mut config = session.begin_configuration().unwrap();
        config.set_preset(ResolutionPreset::UltraHigh).unwrap();
        let err = config.commit().unwrap_err();
        assert!(matches!(err, CameraError::ConfigurationNotSupported(_)));
    }

    assert_eq!(view(&session), before);
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(backend.counters().opens.load(Ordering::SeqCst), 1);
}

#[test]
fn test_second_input_not_supported() {
    let (mut session, _backend) = configured_session();
    let mut config = session.begin_configuration().unwrap();
    let device = front_camera();
    let format = MediaSettings::new(ResolutionPreset::Low)
        .resolve(&device)
        .unwrap();
    let err = config.add_input(device, format).unwrap_err();
    assert!(matches!(err, CameraError::ConfigurationNotSupported(_)));
}
