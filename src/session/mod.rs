//! Capture session graph: one input, its outputs and the connections between them.
//!
//! Mutations happen inside a [`SessionConfiguration`] obtained from
//! [`CaptureSession::begin_configuration`]. The guard holds the session
//! mutably, so nothing else can touch the graph while it is alive, and
//! dropping it without [`SessionConfiguration::commit`] puts the previous
//! graph and state back.

pub mod connection;
pub mod output;
pub mod queue;

pub use connection::{CaptureConnection, ConnectionId};
pub use output::{CaptureOutput, MovieOutput, OutputId, PhotoOutput, VideoDataOutput};
pub use queue::SessionQueue;

use crate::errors::CameraError;
use crate::platform::{lock_stream, CaptureBackend, PhotoCompletion, SharedStream};
use crate::properties::{DeviceControls, ResolutionPreset, VideoStabilization};
use crate::types::{CameraDeviceInfo, DevicePosition, ResolvedFormat};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Configuring,
    Running,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub starts: u64,
    pub stops: u64,
    pub commits: u64,
}

/// The device feeding the session and the format it was configured with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInput {
    pub device: CameraDeviceInfo,
    pub format: ResolvedFormat,
}

#[derive(Debug, Clone, Default)]
struct SessionGraph {
    input: Option<SessionInput>,
    outputs: BTreeMap<OutputId, CaptureOutput>,
    connections: BTreeMap<ConnectionId, CaptureConnection>,
    preset: ResolutionPreset,
    next_output: u32,
    next_connection: u32,
}

impl SessionGraph {
    fn validate(&self) -> Result<(), CameraError> {
        let mut video_connections = 0;
        for connection in self.connections.values() {
            let input = self.input.as_ref().ok_or_else(|| {
                CameraError::InvalidSessionState(format!(
                    "connection {} has no input",
                    connection.id.0
                ))
            })?;
            if connection.input_device_id != input.device.id {
                return Err(CameraError::InvalidSessionState(format!(
                    "connection {} references device {} which is not the session input",
                    connection.id.0, connection.input_device_id
                )));
            }
            let output = self.outputs.get(&connection.output_id).ok_or_else(|| {
                CameraError::InvalidSessionState(format!(
                    "connection {} references missing output {}",
                    connection.id.0, connection.output_id.0
                ))
            })?;
            if connection.enabled && output.is_video_data() {
                video_connections += 1;
            }
        }
        if video_connections > 1 {
            return Err(CameraError::ConfigurationNotSupported(
                "only one active video connection is supported".to_string(),
            ));
        }

        if let Some(input) = &self.input {
            let resolution = input.format.format.resolution;
            let fits_preset = match self.preset.resolution() {
                Some(target) => resolution == target,
                None => input
                    .device
                    .formats
                    .iter()
                    .all(|f| f.resolution.area() <= resolution.area()),
            };
            if !fits_preset {
                return Err(CameraError::ConfigurationNotSupported(format!(
                    "input {} at {} does not match preset {:?}",
                    input.device.id, resolution, self.preset
                )));
            }

            let source = input.format.format.pixel_format;
            for (id, output) in &self.outputs {
                if !output.accepts(source) {
                    return Err(CameraError::ConfigurationNotSupported(format!(
                        "output {} cannot consume {} frames",
                        id.0, source
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    state: SessionState,
    graph: SessionGraph,
    /// Input the open stream was created for.
    opened: Option<SessionInput>,
    stream: Option<SharedStream>,
    controls: DeviceControls,
    stats: SessionStats,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            state: SessionState::Idle,
            graph: SessionGraph::default(),
            opened: None,
            stream: None,
            controls: DeviceControls::default(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn preset(&self) -> ResolutionPreset {
        self.graph.preset
    }

    pub fn input(&self) -> Option<&SessionInput> {
        self.graph.input.as_ref()
    }

    pub fn output(&self, id: OutputId) -> Option<&CaptureOutput> {
        self.graph.outputs.get(&id)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (OutputId, &CaptureOutput)> {
        self.graph.outputs.iter().map(|(id, output)| (*id, output))
    }

    pub fn connections(&self) -> impl Iterator<Item = &CaptureConnection> {
        self.graph.connections.values()
    }

    /// First enabled connection feeding `output_id`.
    pub fn connection_for(&self, output_id: OutputId) -> Option<&CaptureConnection> {
        self.graph
            .connections
            .values()
            .find(|c| c.output_id == output_id && c.enabled)
    }

    /// Open device stream, present once a committed input exists.
    pub fn stream(&self) -> Option<SharedStream> {
        self.stream.clone()
    }

    pub fn controls(&self) -> DeviceControls {
        self.controls
    }

    /// Take the configuration lock.
    pub fn begin_configuration(&mut self) -> Result<SessionConfiguration<'_>, CameraError> {
        if self.state == SessionState::Configuring {
            return Err(CameraError::InvalidSessionState(
                "configuration already in progress".to_string(),
            ));
        }

        let previous_state = self.state;
        let snapshot = self.graph.clone();
        self.state = SessionState::Configuring;
        log::debug!("Session configuration started from {}", previous_state);

        Ok(SessionConfiguration {
            session: self,
            snapshot: Some(snapshot),
            previous_state,
            committed: false,
        })
    }

    fn ensure_configuring(&self, operation: &str) -> Result<(), CameraError> {
        if self.state != SessionState::Configuring {
            return Err(CameraError::InvalidSessionState(format!(
                "{} requires an open configuration (session is {})",
                operation, self.state
            )));
        }
        Ok(())
    }

    pub fn add_input(
        &mut self,
        device: CameraDeviceInfo,
        format: ResolvedFormat,
    ) -> Result<(), CameraError> {
        self.ensure_configuring("add_input")?;
        if let Some(existing) = &self.graph.input {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "session already has input {}",
                existing.device.id
            )));
        }
        if !device.formats.contains(&format.format) || !format.format.supports_fps(format.fps) {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "device {} does not support {} at {} fps",
                device.id, format.format.resolution, format.fps
            )));
        }

        self.graph.input = Some(SessionInput { device, format });
        Ok(())
    }

    /// Remove the input and every connection fed by it.
    pub fn remove_input(&mut self) -> Result<(), CameraError> {
        self.ensure_configuring("remove_input")?;
        self.graph.input = None;
        self.graph.connections.clear();
        Ok(())
    }

    pub fn add_output(&mut self, output: CaptureOutput) -> Result<OutputId, CameraError> {
        self.ensure_configuring("add_output")?;
        let id = OutputId(self.graph.next_output);
        self.graph.next_output += 1;
        self.graph.outputs.insert(id, output);
        Ok(id)
    }

    pub fn remove_output(&mut self, id: OutputId) -> Result<(), CameraError> {
        self.ensure_configuring("remove_output")?;
        if self.graph.outputs.remove(&id).is_none() {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "unknown output {}",
                id.0
            )));
        }
        self.graph.connections.retain(|_, c| c.output_id != id);
        Ok(())
    }

    /// Connect the session input to `output_id`.
    pub fn add_connection(&mut self, output_id: OutputId) -> Result<ConnectionId, CameraError> {
        self.ensure_configuring("add_connection")?;
        let input = self.graph.input.as_ref().ok_or_else(|| {
            CameraError::InvalidSessionState("add an input before connecting outputs".to_string())
        })?;
        if !self.graph.outputs.contains_key(&output_id) {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "unknown output {}",
                output_id.0
            )));
        }

        let id = ConnectionId(self.graph.next_connection);
        let mut connection = CaptureConnection::new(id, input.device.id.clone(), output_id);
        connection.mirrored = input.device.position == DevicePosition::Front;
        self.graph.next_connection += 1;
        self.graph.connections.insert(id, connection);
        Ok(id)
    }

    pub fn set_preset(&mut self, preset: ResolutionPreset) -> Result<(), CameraError> {
        self.ensure_configuring("set_preset")?;
        self.graph.preset = preset;
        Ok(())
    }

    /// Idempotent: starting a running session is a no-op.
    pub fn start_running(&mut self) -> Result<(), CameraError> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Configuring => {
                return Err(CameraError::InvalidSessionState(
                    "cannot start while configuring".to_string(),
                ))
            }
            SessionState::Idle | SessionState::Stopped => {}
        }

        let stream = self.stream.as_ref().ok_or_else(|| {
            CameraError::InvalidSessionState("no committed input to start".to_string())
        })?;
        lock_stream(stream)?.start_stream()?;

        self.state = SessionState::Running;
        self.stats.starts += 1;
        log::info!("Capture session running on {}", self.device_label());
        Ok(())
    }

    /// Idempotent: stopping a session that is not running is a no-op.
    pub fn stop_running(&mut self) -> Result<(), CameraError> {
        match self.state {
            SessionState::Running => {}
            SessionState::Configuring => {
                return Err(CameraError::InvalidSessionState(
                    "cannot stop while configuring".to_string(),
                ))
            }
            SessionState::Idle | SessionState::Stopped => return Ok(()),
        }

        if let Some(stream) = &self.stream {
            lock_stream(stream)?.stop_stream()?;
        }
        self.state = SessionState::Stopped;
        self.stats.stops += 1;
        log::info!("Capture session stopped on {}", self.device_label());
        Ok(())
    }

    /// Record an interruption reported by the device. The stream is already
    /// unusable, so stop errors are only logged.
    pub fn mark_interrupted(&mut self) {
        if self.state != SessionState::Running {
            return;
        }
        if let Some(stream) = &self.stream {
            match lock_stream(stream) {
                Ok(mut stream) => {
                    if let Err(e) = stream.stop_stream() {
                        log::warn!("Stopping interrupted stream failed: {}", e);
                    }
                }
                Err(e) => log::warn!("Interrupted stream unavailable: {}", e),
            }
        }
        for output in self.graph.outputs.values_mut() {
            match output {
                CaptureOutput::VideoData(video) => video.streaming = false,
                CaptureOutput::Movie(movie) => movie.recording = false,
                CaptureOutput::Photo(_) => {}
            }
        }
        self.state = SessionState::Stopped;
        self.stats.stops += 1;
        log::warn!("Capture session interrupted on {}", self.device_label());
    }

    /// Tear the graph down and release the device.
    pub fn reset(&mut self) -> Result<(), CameraError> {
        match self.state {
            SessionState::Idle | SessionState::Stopped => {}
            other => {
                return Err(CameraError::InvalidSessionState(format!(
                    "cannot reset a {} session",
                    other
                )))
            }
        }

        self.release_stream();
        self.graph = SessionGraph::default();
        self.state = SessionState::Idle;
        log::debug!("Capture session reset");
        Ok(())
    }

    /// Mutate connection flags (rotation, mirroring, stabilization) without
    /// reconfiguring the graph.
    pub fn update_connections<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut CaptureConnection),
    {
        for connection in self.graph.connections.values_mut() {
            f(connection);
        }
    }

    /// Apply a stabilization mode to every connection feeding a video data
    /// or movie output. Returns how many connections changed.
    pub fn set_video_stabilization(&mut self, mode: VideoStabilization) -> usize {
        let outputs = &self.graph.outputs;
        let mut updated = 0;
        for connection in self.graph.connections.values_mut() {
            let is_video = outputs
                .get(&connection.output_id)
                .is_some_and(CaptureOutput::is_video);
            if is_video && connection.stabilization != mode {
                connection.stabilization = mode;
                updated += 1;
            }
        }
        updated
    }

    /// Turn frame delivery on or off for a video data output.
    pub fn set_video_streaming(&mut self, id: OutputId, streaming: bool) -> Result<(), CameraError> {
        if streaming && self.state != SessionState::Running {
            return Err(CameraError::InvalidSessionState(format!(
                "cannot stream from a {} session",
                self.state
            )));
        }
        match self.graph.outputs.get_mut(&id) {
            Some(CaptureOutput::VideoData(video)) => {
                video.streaming = streaming;
                Ok(())
            }
            Some(_) => Err(CameraError::ConfigurationNotSupported(format!(
                "output {} is not a video data output",
                id.0
            ))),
            None => Err(CameraError::ConfigurationNotSupported(format!(
                "unknown output {}",
                id.0
            ))),
        }
    }

    /// Mark a movie output as recording or idle. Recording needs a running
    /// session and a connected output, and only one recording at a time.
    pub fn set_movie_recording(&mut self, id: OutputId, recording: bool) -> Result<(), CameraError> {
        if recording {
            if self.state != SessionState::Running {
                return Err(CameraError::InvalidSessionState(format!(
                    "cannot record from a {} session",
                    self.state
                )));
            }
            if self.connection_for(id).is_none() {
                return Err(CameraError::ConfigurationNotSupported(format!(
                    "output {} is not connected",
                    id.0
                )));
            }
        }
        match self.graph.outputs.get_mut(&id) {
            Some(CaptureOutput::Movie(movie)) => {
                if recording && movie.recording {
                    return Err(CameraError::InvalidSessionState(
                        "a recording is already in progress".to_string(),
                    ));
                }
                movie.recording = recording;
                Ok(())
            }
            Some(_) => Err(CameraError::ConfigurationNotSupported(format!(
                "output {} is not a movie output",
                id.0
            ))),
            None => Err(CameraError::ConfigurationNotSupported(format!(
                "unknown output {}",
                id.0
            ))),
        }
    }

    pub fn is_recording(&self, id: OutputId) -> bool {
        matches!(
            self.graph.outputs.get(&id),
            Some(CaptureOutput::Movie(MovieOutput { recording: true, .. }))
        )
    }

    pub fn is_streaming(&self, id: OutputId) -> bool {
        matches!(
            self.graph.outputs.get(&id),
            Some(CaptureOutput::VideoData(VideoDataOutput { streaming: true, .. }))
        )
    }

    /// Trigger a still capture on a photo output. The completion fires later
    /// on a device thread.
    pub fn capture_photo(
        &mut self,
        id: OutputId,
        completion: PhotoCompletion,
    ) -> Result<(), CameraError> {
        if self.state != SessionState::Running {
            return Err(CameraError::InvalidSessionState(format!(
                "cannot take a picture from a {} session",
                self.state
            )));
        }
        match self.graph.outputs.get(&id) {
            Some(CaptureOutput::Photo(_)) => {}
            _ => {
                return Err(CameraError::ConfigurationNotSupported(format!(
                    "output {} is not a photo output",
                    id.0
                )))
            }
        }

        let stream = self.stream.as_ref().ok_or_else(|| {
            CameraError::InvalidSessionState("no device stream".to_string())
        })?;
        lock_stream(stream)?.capture_photo(completion);
        Ok(())
    }

    pub fn apply_controls(&mut self, controls: DeviceControls) -> Result<(), CameraError> {
        if let Some(stream) = &self.stream {
            lock_stream(stream)?.apply_controls(&controls)?;
        }
        self.controls = controls;
        for output in self.graph.outputs.values_mut() {
            if let CaptureOutput::Photo(photo) = output {
                photo.flash_mode = controls.flash_mode;
            }
        }
        Ok(())
    }

    fn device_label(&self) -> String {
        self.graph
            .input
            .as_ref()
            .map(|i| i.device.id.clone())
            .unwrap_or_else(|| "<no input>".to_string())
    }

    fn release_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Ok(mut stream) = stream.lock() {
                if let Err(e) = stream.stop_stream() {
                    log::warn!("Stopping released stream failed: {}", e);
                }
            }
        }
        self.opened = None;
    }

    /// Bring the opened stream in line with the committed input.
    fn sync_stream(&mut self, resume: bool) -> Result<(), CameraError> {
        if self.opened == self.graph.input {
            return Ok(());
        }

        let Some(input) = self.graph.input.clone() else {
            self.release_stream();
            return Ok(());
        };

        let mut stream = self.backend.open_device(&input.device, &input.format)?;
        stream.apply_controls(&self.controls)?;
        if resume {
            stream.start_stream()?;
        }

        self.release_stream();
        log::info!(
            "Opened {} ({}) at {} fps through {} backend",
            input.device.name,
            input.device.id,
            input.format.fps,
            self.backend.name()
        );
        self.stream = Some(Arc::new(Mutex::new(stream)));
        self.opened = Some(input);
        Ok(())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release_stream();
    }
}

/// Exclusive configuration lock over a [`CaptureSession`].
///
/// Dropped without `commit` (including on `?` early return), the graph and
/// state in effect before `begin_configuration` are restored.
pub struct SessionConfiguration<'a> {
    session: &'a mut CaptureSession,
    snapshot: Option<SessionGraph>,
    previous_state: SessionState,
    committed: bool,
}

impl<'a> SessionConfiguration<'a> {
    pub fn session(&self) -> &CaptureSession {
        self.session
    }

    pub fn add_input(
        &mut self,
        device: CameraDeviceInfo,
        format: ResolvedFormat,
    ) -> Result<(), CameraError> {
        self.session.add_input(device, format)
    }

    pub fn remove_input(&mut self) -> Result<(), CameraError> {
        self.session.remove_input()
    }

    pub fn add_output(&mut self, output: CaptureOutput) -> Result<OutputId, CameraError> {
        self.session.add_output(output)
    }

    pub fn remove_output(&mut self, id: OutputId) -> Result<(), CameraError> {
        self.session.remove_output(id)
    }

    pub fn add_connection(&mut self, output_id: OutputId) -> Result<ConnectionId, CameraError> {
        self.session.add_connection(output_id)
    }

    pub fn set_preset(&mut self, preset: ResolutionPreset) -> Result<(), CameraError> {
        self.session.set_preset(preset)
    }

    /// Validate the graph, open the device if the input changed and release
    /// the lock. On error the guard is dropped and the old graph restored.
    pub fn commit(mut self) -> Result<(), CameraError> {
        self.session.graph.validate()?;

        let was_running = self.previous_state == SessionState::Running;
        self.session.sync_stream(was_running)?;

        self.session.state = match self.previous_state {
            SessionState::Running if self.session.stream.is_none() => {
                self.session.stats.stops += 1;
                SessionState::Stopped
            }
            other => other,
        };
        self.session.stats.commits += 1;
        self.committed = true;
        log::debug!(
            "Session configuration committed: {} outputs, {} connections",
            self.session.graph.outputs.len(),
            self.session.graph.connections.len()
        );
        Ok(())
    }
}

impl Drop for SessionConfiguration<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(snapshot) = self.snapshot.take() {
            self.session.graph = snapshot;
        }
        self.session.state = self.previous_state;
        log::debug!("Session configuration rolled back to {}", self.previous_state);
    }
}
