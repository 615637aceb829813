//! Camera controller: the per-device façade the host talks to.
//!
//! A [`Camera`] owns one capture session (on its [`SessionQueue`] thread), a
//! frame pump feeding the image stream and any active recording, the photo
//! request registry and the event channel. All methods take `&self` so a camera can be
//! shared behind an `Arc`.

use crate::config::CamCoreConfig;
use crate::discovery::DeviceDiscovery;
use crate::errors::CameraError;
use crate::media_settings::MediaSettings;
use crate::orientation::{DeviceOrientationProvider, FixedOrientation};
use crate::permissions::{PermissionManager, PermissionService, PermissionStatus};
use crate::photo::{
    photo_path, FilePhotoWriter, PhotoCaptureRequest, PhotoRequestRegistry, PhotoTarget,
    PhotoWriter, SavePhotoDelegate,
};
use crate::platform::{lock_stream, CaptureBackend, SharedStream};
use crate::properties::{
    DeviceControls, DeviceOrientation, ExposureMode, FlashMode, FocusMode, VideoStabilization,
};
use crate::recording::{
    default_writer_factory, recording_path, ActiveRecording, RecordingSettings, RecordingState,
    RecordingStats, VideoWriterFactory,
};
use crate::session::{
    CaptureOutput, CaptureSession, MovieOutput, OutputId, PhotoOutput, SessionQueue, SessionState,
    SessionStats, VideoDataOutput,
};
use crate::stream::{CameraEvent, EventChannel, ImageStreamHandler};
use crate::types::{CameraDeviceInfo, CameraFrame, MediaType, PixelFormat, ResolvedFormat};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;

/// Consecutive non-fatal capture errors tolerated before the pump gives up.
const MAX_PUMP_ERRORS: u32 = 5;

/// Everything a camera needs from its surroundings.
#[derive(Clone)]
pub struct CameraEnvironment {
    pub backend: Arc<dyn CaptureBackend>,
    pub permissions: PermissionManager,
    pub orientation: Arc<dyn DeviceOrientationProvider>,
    pub photo_writer: Arc<dyn PhotoWriter>,
    pub video_writer: Arc<dyn VideoWriterFactory>,
    pub config: CamCoreConfig,
}

impl CameraEnvironment {
    pub fn new(backend: Arc<dyn CaptureBackend>, permissions: Arc<dyn PermissionService>) -> Self {
        Self {
            backend,
            permissions: PermissionManager::new(permissions),
            orientation: Arc::new(FixedOrientation::default()),
            photo_writer: Arc::new(FilePhotoWriter::new()),
            video_writer: default_writer_factory(),
            config: CamCoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CamCoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_orientation(mut self, orientation: Arc<dyn DeviceOrientationProvider>) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_photo_writer(mut self, writer: Arc<dyn PhotoWriter>) -> Self {
        self.photo_writer = writer;
        self
    }

    pub fn with_video_writer(mut self, factory: Arc<dyn VideoWriterFactory>) -> Self {
        self.video_writer = factory;
        self
    }

    pub fn discovery(&self) -> DeviceDiscovery {
        DeviceDiscovery::new(self.backend.clone())
    }
}

/// Rotation and mirroring stamped on preview frames.
#[derive(Default)]
struct FrameTags {
    rotation_degrees: AtomicU16,
    mirrored: AtomicBool,
}

impl FrameTags {
    fn set(&self, rotation_degrees: u16, mirrored: bool) {
        self.rotation_degrees.store(rotation_degrees, Ordering::Relaxed);
        self.mirrored.store(mirrored, Ordering::Relaxed);
    }

    fn apply(&self, frame: &mut CameraFrame) {
        frame.rotation_degrees = self.rotation_degrees.load(Ordering::Relaxed);
        frame.mirrored = self.mirrored.load(Ordering::Relaxed);
    }
}

/// Consumers the frame pump feeds, shared with the pump thread.
#[derive(Default)]
struct PumpTargets {
    preview: AtomicBool,
    preview_paused: AtomicBool,
    recording: Mutex<Option<ActiveRecording>>,
}

impl PumpTargets {
    fn delivers_preview(&self) -> bool {
        self.preview.load(Ordering::SeqCst) && !self.preview_paused.load(Ordering::SeqCst)
    }

    fn has_recording(&self) -> bool {
        self.recording.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    fn recording_state(&self) -> Option<RecordingState> {
        self.recording
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.state()))
    }

    /// Nothing needs frames, so the pump can go.
    fn idle(&self) -> bool {
        !self.preview.load(Ordering::SeqCst) && !self.has_recording()
    }
}

pub struct Camera {
    device: CameraDeviceInfo,
    format: ResolvedFormat,
    settings: MediaSettings,
    env: CameraEnvironment,
    queue: Arc<SessionQueue>,
    photo_output: OutputId,
    video_output: OutputId,
    movie_output: OutputId,
    events: EventChannel,
    stream_handler: ImageStreamHandler,
    photos: Arc<PhotoRequestRegistry>,
    pump: Mutex<Option<FramePump>>,
    targets: Arc<PumpTargets>,
    tags: Arc<FrameTags>,
    orientation_lock: Mutex<Option<DeviceOrientation>>,
    controls: Mutex<DeviceControls>,
    closed: AtomicBool,
}

impl Camera {
    /// Check permissions, resolve the device and settings, build the session
    /// graph and start it running.
    pub async fn open(
        device_id: &str,
        settings: MediaSettings,
        env: CameraEnvironment,
    ) -> Result<Camera, CameraError> {
        log::info!("Opening camera {}", device_id);

        // Permission gates everything else, including enumeration.
        ensure_permission(&env, MediaType::Video).await?;
        if settings.enable_audio {
            ensure_permission(&env, MediaType::Audio).await?;
        }

        let discovery = env.discovery();
        let lookup_id = device_id.to_string();
        let device = tokio::task::spawn_blocking(move || discovery.find_device(&lookup_id))
            .await
            .map_err(|e| CameraError::DeviceUnavailable(format!("device lookup failed: {e}")))??;
        if device.media_type != MediaType::Video {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "{} is not a video device",
                device.id
            )));
        }

        let format = settings.resolve(&device)?;
        log::debug!("Resolved {} to {} at {} fps", device.id, format.format, format.fps);

        let queue = Arc::new(SessionQueue::spawn(
            CaptureSession::new(env.backend.clone()),
            &device.id,
        )?);

        let orientation = env.orientation.orientation();
        let built = queue
            .run({
                let device = device.clone();
                let format = format.clone();
                let settings = settings.clone();
                let buffer_policy = env.config.buffer_policy();
                let bitrate = env.config.recording.video_bitrate;
                move |session| {
                    build_graph(
                        session,
                        device,
                        format,
                        &settings,
                        buffer_policy,
                        bitrate,
                        orientation,
                    )
                }
            })
            .await
            .and_then(|r| r);

        let (photo_output, video_output, movie_output, video_tags) = match built {
            Ok(outputs) => outputs,
            Err(e) => {
                log::warn!("Failed to open camera {}: {}", device.id, e);
                if let Err(shutdown) = queue.shutdown().await {
                    log::warn!("Session queue shutdown failed: {}", shutdown);
                }
                return Err(e);
            }
        };

        let events = EventChannel::new();
        let stream_handler = ImageStreamHandler::new(env.config.buffer_policy(), events.clone());
        let tags = Arc::new(FrameTags::default());
        tags.set(video_tags.0, video_tags.1);

        log::info!(
            "Camera {} ({}) open at {} {} fps",
            device.name,
            device.id,
            format.format.resolution,
            format.fps
        );

        Ok(Camera {
            device,
            format,
            settings,
            env,
            queue,
            photo_output,
            video_output,
            movie_output,
            events,
            stream_handler,
            photos: Arc::new(PhotoRequestRegistry::new()),
            pump: Mutex::new(None),
            targets: Arc::new(PumpTargets::default()),
            tags,
            orientation_lock: Mutex::new(None),
            controls: Mutex::new(DeviceControls::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &CameraDeviceInfo {
        &self.device
    }

    pub fn format(&self) -> &ResolvedFormat {
        &self.format
    }

    pub fn settings(&self) -> &MediaSettings {
        &self.settings
    }

    /// Event subscription handle. Clones share one receiver.
    pub fn events(&self) -> EventChannel {
        self.events.clone()
    }

    pub fn stream_handler(&self) -> ImageStreamHandler {
        self.stream_handler.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_photos(&self) -> usize {
        self.photos.pending_count()
    }

    pub async fn state(&self) -> Result<SessionState, CameraError> {
        self.queue.run(|session| session.state()).await
    }

    pub async fn stats(&self) -> Result<SessionStats, CameraError> {
        self.queue.run(|session| session.stats()).await
    }

    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.is_closed() {
            return Err(CameraError::InvalidSessionState(format!(
                "camera {} is closed",
                self.device.id
            )));
        }
        Ok(())
    }

    fn pump_alive(&self) -> bool {
        self.pump
            .lock()
            .map(|p| p.as_ref().is_some_and(|pump| !pump.has_exited()))
            .unwrap_or(false)
    }

    /// True while frames reach the image stream. A pump that ended on its
    /// own (interruption, repeated capture errors) no longer counts.
    pub fn is_previewing(&self) -> bool {
        self.targets.preview.load(Ordering::SeqCst) && self.pump_alive()
    }

    /// Take a pump that stopped by itself out of its slot and join it.
    async fn reap_exited_pump(&self) -> Result<(), CameraError> {
        let exited = {
            let mut slot = self.pump.lock().map_err(|_| CameraError::poisoned_lock())?;
            match slot.as_ref() {
                Some(pump) if pump.has_exited() => slot.take(),
                _ => None,
            }
        };
        if let Some(pump) = exited {
            pump.stop().await;
            self.targets.preview.store(false, Ordering::SeqCst);
            log::debug!("Reaped exited frame pump for camera {}", self.device.id);
        }
        Ok(())
    }

    /// Make sure a pump is pulling frames from the device.
    async fn ensure_pump(&self) -> Result<(), CameraError> {
        self.reap_exited_pump().await?;
        if self.pump_alive() {
            return Ok(());
        }

        let stream = self
            .queue
            .run(|session| {
                session.stream().ok_or_else(|| {
                    CameraError::InvalidSessionState("no device stream".to_string())
                })
            })
            .await??;

        let pump = FramePump::spawn(
            stream,
            PumpContext {
                label: self.device.id.clone(),
                handler: self.stream_handler.clone(),
                events: self.events.clone(),
                queue: self.queue.clone(),
                tags: self.tags.clone(),
                targets: self.targets.clone(),
                pixel_format: self.settings.stream_pixel_format,
            },
        )?;

        let surplus = {
            let mut slot = self.pump.lock().map_err(|_| CameraError::poisoned_lock())?;
            if slot.is_some() {
                Some(pump)
            } else {
                *slot = Some(pump);
                None
            }
        };
        // Lost a race with a concurrent start; keep the first pump.
        if let Some(pump) = surplus {
            pump.stop().await;
        }
        Ok(())
    }

    /// Stop the pump once neither preview nor a recording needs it.
    async fn release_pump_if_idle(&self) -> Result<(), CameraError> {
        self.reap_exited_pump().await?;
        if !self.targets.idle() {
            return Ok(());
        }
        let pump = self
            .pump
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?
            .take();
        if let Some(pump) = pump {
            pump.stop().await;
        }
        Ok(())
    }

    /// Start delivering frames to the image stream. No-op when already
    /// previewing.
    pub async fn start_preview(&self) -> Result<(), CameraError> {
        self.ensure_open()?;
        self.reap_exited_pump().await?;
        if self.is_previewing() {
            return Ok(());
        }

        let video_output = self.video_output;
        self.queue
            .run(move |session| session.set_video_streaming(video_output, true))
            .await??;

        self.targets.preview_paused.store(false, Ordering::SeqCst);
        self.targets.preview.store(true, Ordering::SeqCst);
        if let Err(e) = self.ensure_pump().await {
            self.targets.preview.store(false, Ordering::SeqCst);
            if let Err(reset) = self
                .queue
                .run(move |session| session.set_video_streaming(video_output, false))
                .await
                .and_then(|r| r)
            {
                log::debug!("Could not reset video streaming: {}", reset);
            }
            return Err(e);
        }
        log::info!("Preview started for camera {}", self.device.id);
        Ok(())
    }

    /// Stop frame delivery. No-op when not previewing.
    pub async fn stop_preview(&self) -> Result<(), CameraError> {
        let was_previewing = self.targets.preview.swap(false, Ordering::SeqCst);
        self.targets.preview_paused.store(false, Ordering::SeqCst);
        self.release_pump_if_idle().await?;
        if !was_previewing {
            return Ok(());
        }

        let video_output = self.video_output;
        self.queue
            .run(move |session| session.set_video_streaming(video_output, false))
            .await??;
        log::info!("Preview stopped for camera {}", self.device.id);
        Ok(())
    }

    /// Hold frame delivery without releasing the stream.
    pub fn pause_preview(&self) -> Result<(), CameraError> {
        self.set_paused(true)
    }

    pub fn resume_preview(&self) -> Result<(), CameraError> {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> Result<(), CameraError> {
        self.ensure_open()?;
        if !self.is_previewing() {
            return Err(CameraError::InvalidSessionState(
                "preview is not running".to_string(),
            ));
        }
        self.targets.preview_paused.store(paused, Ordering::SeqCst);
        log::debug!(
            "Preview {} for camera {}",
            if paused { "paused" } else { "resumed" },
            self.device.id
        );
        Ok(())
    }

    /// Start writing frames to a new movie file and return its path.
    pub async fn start_video_recording(&self) -> Result<PathBuf, CameraError> {
        self.ensure_open()?;
        if self.targets.has_recording() {
            return Err(CameraError::InvalidSessionState(
                "a recording is already in progress".to_string(),
            ));
        }

        let movie_output = self.movie_output;
        let stabilization = self
            .queue
            .run(move |session| -> Result<VideoStabilization, CameraError> {
                session.set_movie_recording(movie_output, true)?;
                Ok(session
                    .connection_for(movie_output)
                    .map(|c| c.stabilization)
                    .unwrap_or_default())
            })
            .await??;

        let config = &self.env.config;
        let path = recording_path(
            &config.output_directory(),
            config.storage.organize_by_date,
            uuid::Uuid::new_v4(),
            chrono::Local::now(),
        );
        let resolution = self.format.format.resolution;
        let settings = RecordingSettings::new(resolution.width, resolution.height, self.format.fps)
            .with_bitrate(config.recording.video_bitrate)
            .with_fast_start(config.recording.fast_start)
            .with_stabilization(stabilization);
        let factory = self.env.video_writer.clone();
        let created = tokio::task::spawn_blocking({
            let path = path.clone();
            move || factory.create(&path, &settings)
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("recording setup task failed: {e}")))
        .and_then(|r| r);

        let started = match created {
            Ok(writer) => {
                let stored = self
                    .targets
                    .recording
                    .lock()
                    .map(|mut slot| *slot = Some(ActiveRecording::new(path.clone(), writer)))
                    .map_err(|_| CameraError::poisoned_lock());
                match stored {
                    Ok(()) => self.ensure_pump().await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = started {
            log::warn!("Recording on {} failed to start: {}", self.device.id, e);
            let abandoned = self.targets.recording.lock().ok().and_then(|mut r| r.take());
            if let Some(recording) = abandoned {
                let _ = tokio::task::spawn_blocking(move || recording.finish()).await;
            }
            if let Err(reset) = self
                .queue
                .run(move |session| session.set_movie_recording(movie_output, false))
                .await
                .and_then(|r| r)
            {
                log::debug!("Could not reset movie output: {}", reset);
            }
            return Err(e);
        }

        log::info!("Recording {} on camera {}", path.display(), self.device.id);
        Ok(path)
    }

    /// Finish the current recording and close its file.
    pub async fn stop_video_recording(&self) -> Result<RecordingStats, CameraError> {
        let recording = self
            .targets
            .recording
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?
            .take()
            .ok_or_else(|| {
                CameraError::InvalidSessionState("no recording in progress".to_string())
            })?;

        let movie_output = self.movie_output;
        if let Err(e) = self
            .queue
            .run(move |session| session.set_movie_recording(movie_output, false))
            .await
            .and_then(|r| r)
        {
            log::debug!("Could not reset movie output: {}", e);
        }
        self.release_pump_if_idle().await?;

        let stats = tokio::task::spawn_blocking(move || recording.finish())
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("recording finish task failed: {e}")))??;
        log::info!(
            "Recording {} stopped after {} frames",
            stats.path.display(),
            stats.video_frames
        );
        Ok(stats)
    }

    pub fn pause_video_recording(&self) -> Result<(), CameraError> {
        self.set_recording_paused(true)
    }

    pub fn resume_video_recording(&self) -> Result<(), CameraError> {
        self.set_recording_paused(false)
    }

    fn set_recording_paused(&self, paused: bool) -> Result<(), CameraError> {
        self.ensure_open()?;
        let mut slot = self
            .targets
            .recording
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?;
        let recording = slot.as_mut().ok_or_else(|| {
            CameraError::InvalidSessionState("no recording in progress".to_string())
        })?;
        recording.set_paused(paused)
    }

    /// State of the current recording while frames can still reach it.
    pub fn recording_state(&self) -> Option<RecordingState> {
        self.targets
            .recording_state()
            .filter(|_| self.pump_alive())
    }

    pub fn is_recording(&self) -> bool {
        self.recording_state() == Some(RecordingState::Recording)
    }

    /// Stabilization for the preview and recording connections.
    pub async fn set_video_stabilization(
        &self,
        mode: VideoStabilization,
    ) -> Result<(), CameraError> {
        self.ensure_open()?;
        let updated = self
            .queue
            .run(move |session| session.set_video_stabilization(mode))
            .await?;
        log::debug!(
            "Camera {} stabilization {:?} on {} connection(s)",
            self.device.id,
            mode,
            updated
        );
        Ok(())
    }

    pub async fn video_stabilization(&self) -> Result<VideoStabilization, CameraError> {
        let video_output = self.video_output;
        self.queue
            .run(move |session| {
                session
                    .connection_for(video_output)
                    .map(|c| c.stabilization)
                    .unwrap_or_default()
            })
            .await
    }

    /// Take a picture and wait for the saved file.
    pub async fn take_picture(&self) -> Result<PathBuf, CameraError> {
        self.take_picture_request().await?.wait().await
    }

    /// Trigger a picture and return the pending request without waiting.
    pub async fn take_picture_request(&self) -> Result<PhotoCaptureRequest, CameraError> {
        self.ensure_open()?;
        let request = self.photos.register()?;
        let id = request.id();

        let path = photo_path(
            &self.env.config.output_directory(),
            self.env.config.storage.organize_by_date,
            self.settings.image_format,
            id,
            chrono::Local::now(),
        );
        let format = self.settings.image_format;
        let jpeg_quality = self.settings.jpeg_quality;
        let registry = self.photos.clone();
        let writer = self.env.photo_writer.clone();
        let runtime = Handle::current();
        let photo_output = self.photo_output;

        let triggered = self
            .queue
            .run(move |session| {
                let (rotation_degrees, mirrored) = session
                    .connection_for(photo_output)
                    .map(|c| (c.rotation_degrees(), c.mirrored))
                    .unwrap_or((0, false));
                let target = PhotoTarget {
                    path,
                    format,
                    jpeg_quality,
                    rotation_degrees,
                    mirrored,
                };
                let delegate = SavePhotoDelegate::new(id, &registry, writer, target, runtime);
                session.capture_photo(photo_output, delegate.completion())
            })
            .await
            .and_then(|r| r);

        if let Err(e) = triggered {
            self.photos.resolve(id, Err(e.clone()));
            return Err(e);
        }
        log::debug!("Photo {} requested on {}", id, self.device.id);
        Ok(request)
    }

    /// Lock capture orientation.
    pub async fn set_orientation(&self, orientation: DeviceOrientation) -> Result<(), CameraError> {
        self.ensure_open()?;
        *self
            .orientation_lock
            .lock()
            .map_err(|_| CameraError::poisoned_lock())? = Some(orientation);
        self.apply_orientation(orientation).await
    }

    /// Follow the device orientation provider again.
    pub async fn unlock_orientation(&self) -> Result<(), CameraError> {
        self.ensure_open()?;
        *self
            .orientation_lock
            .lock()
            .map_err(|_| CameraError::poisoned_lock())? = None;
        self.apply_orientation(self.env.orientation.orientation())
            .await
    }

    pub fn locked_orientation(&self) -> Option<DeviceOrientation> {
        self.orientation_lock.lock().ok().and_then(|o| *o)
    }

    async fn apply_orientation(&self, orientation: DeviceOrientation) -> Result<(), CameraError> {
        let video_output = self.video_output;
        let (rotation, mirrored) = self
            .queue
            .run(move |session| {
                session.update_connections(|c| c.orientation = orientation);
                session
                    .connection_for(video_output)
                    .map(|c| (c.rotation_degrees(), c.mirrored))
                    .unwrap_or((orientation.rotation_degrees(), false))
            })
            .await?;
        self.tags.set(rotation, mirrored);
        log::debug!("Camera {} orientation {:?}", self.device.id, orientation);
        Ok(())
    }

    pub async fn set_flash_mode(&self, mode: FlashMode) -> Result<(), CameraError> {
        let supported = match mode {
            FlashMode::Off => true,
            FlashMode::Auto | FlashMode::Always => self.device.has_flash,
            FlashMode::Torch => self.device.has_torch,
        };
        if !supported {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "{} does not support flash mode {:?}",
                self.device.id, mode
            )));
        }
        self.update_controls(|c| c.flash_mode = mode).await
    }

    pub async fn set_focus_mode(&self, mode: FocusMode) -> Result<(), CameraError> {
        self.update_controls(|c| c.focus_mode = mode).await
    }

    pub async fn set_exposure_mode(&self, mode: ExposureMode) -> Result<(), CameraError> {
        self.update_controls(|c| c.exposure_mode = mode).await
    }

    pub async fn set_zoom_level(&self, zoom: f32) -> Result<(), CameraError> {
        if !(zoom >= self.min_zoom() && zoom <= self.max_zoom()) {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "zoom {} outside {}-{}",
                zoom,
                self.min_zoom(),
                self.max_zoom()
            )));
        }
        self.update_controls(|c| c.zoom_level = zoom).await
    }

    pub fn min_zoom(&self) -> f32 {
        self.device.min_zoom
    }

    pub fn max_zoom(&self) -> f32 {
        self.device.max_zoom
    }

    pub fn controls(&self) -> DeviceControls {
        self.controls.lock().map(|c| *c).unwrap_or_default()
    }

    async fn update_controls<F>(&self, f: F) -> Result<(), CameraError>
    where
        F: FnOnce(&mut DeviceControls),
    {
        self.ensure_open()?;
        let mut controls = self.controls();
        f(&mut controls);
        self.queue
            .run(move |session| session.apply_controls(controls))
            .await??;
        *self.controls.lock().map_err(|_| CameraError::poisoned_lock())? = controls;
        Ok(())
    }

    /// Release the camera. Waits a bounded time for in-flight photos, then
    /// fails the rest. Idempotent.
    pub async fn close(&self) -> Result<(), CameraError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Closing camera {}", self.device.id);

        let pump = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            pump.stop().await;
        }
        self.targets.preview.store(false, Ordering::SeqCst);

        let recording = self.targets.recording.lock().ok().and_then(|mut r| r.take());
        if let Some(recording) = recording {
            match tokio::task::spawn_blocking(move || recording.finish()).await {
                Ok(Ok(stats)) => log::info!(
                    "Recording {} finalized on close ({} frames)",
                    stats.path.display(),
                    stats.video_frames
                ),
                Ok(Err(e)) => log::warn!("Recording on {} failed: {}", self.device.id, e),
                Err(e) => log::warn!("Recording finish task failed: {}", e),
            }
        }

        self.photos.close();
        if !self.photos.wait_idle(self.env.config.close_timeout()).await {
            let failed = self.photos.fail_all(CameraError::CaptureFailed(
                "camera closed before the photo completed".to_string(),
            ));
            log::warn!(
                "Camera {} closed with {} unfinished photo(s)",
                self.device.id,
                failed
            );
        }

        let teardown = self
            .queue
            .run(|session| {
                session.stop_running()?;
                session.reset()
            })
            .await
            .and_then(|r| r);
        if let Err(e) = teardown {
            log::warn!("Session teardown for {} failed: {}", self.device.id, e);
        }

        self.queue.shutdown().await?;
        self.stream_handler.close();
        self.events.send(CameraEvent::Closed);
        log::info!("Camera {} closed", self.device.id);
        Ok(())
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(pump) = pump.as_mut() {
                pump.stop_flag.store(true, Ordering::SeqCst);
            }
        }
        if !self.is_closed() {
            log::debug!("Camera {} dropped without close", self.device.id);
        }
    }
}

async fn ensure_permission(env: &CameraEnvironment, media_type: MediaType) -> Result<(), CameraError> {
    if !env.config.permissions.auto_request
        && env.permissions.authorization_status(media_type) == PermissionStatus::NotDetermined
    {
        return Err(CameraError::PermissionDenied(format!(
            "{media_type} access not determined and prompting is disabled"
        )));
    }
    env.permissions.ensure_authorized(media_type).await
}

/// One input with photo, video data and movie outputs, each connected, then
/// committed and started. Returns the output ids and the video connection's
/// rotation and mirroring.
fn build_graph(
    session: &mut CaptureSession,
    device: CameraDeviceInfo,
    format: ResolvedFormat,
    settings: &MediaSettings,
    buffer_policy: crate::stream::BufferPolicy,
    bitrate: u32,
    orientation: DeviceOrientation,
) -> Result<(OutputId, OutputId, OutputId, (u16, bool)), CameraError> {
    let mut config = session.begin_configuration()?;
    config.set_preset(settings.resolution_preset)?;
    config.add_input(device, format)?;
    let photo = config.add_output(CaptureOutput::Photo(PhotoOutput {
        image_format: settings.image_format,
        jpeg_quality: settings.jpeg_quality,
        flash_mode: FlashMode::Off,
    }))?;
    let video = config.add_output(CaptureOutput::VideoData(VideoDataOutput {
        pixel_format: settings.stream_pixel_format,
        buffer_policy,
        streaming: false,
    }))?;
    let movie = config.add_output(CaptureOutput::Movie(MovieOutput {
        bitrate,
        recording: false,
    }))?;
    config.add_connection(photo)?;
    config.add_connection(video)?;
    config.add_connection(movie)?;
    config.commit()?;

    session.update_connections(|c| c.orientation = orientation);
    session.start_running()?;

    let tags = session
        .connection_for(video)
        .map(|c| (c.rotation_degrees(), c.mirrored))
        .unwrap_or_default();
    Ok((photo, video, movie, tags))
}

struct PumpContext {
    label: String,
    handler: ImageStreamHandler,
    events: EventChannel,
    queue: Arc<SessionQueue>,
    tags: Arc<FrameTags>,
    targets: Arc<PumpTargets>,
    pixel_format: PixelFormat,
}

/// Thread pulling frames from the device into the image stream.
struct FramePump {
    stop_flag: Arc<AtomicBool>,
    /// Set by the pump thread when its loop ends, for whatever reason.
    exited: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FramePump {
    fn spawn(stream: SharedStream, ctx: PumpContext) -> Result<Self, CameraError> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new()
            .name(format!("camcore-pump-{}", ctx.label))
            .spawn({
                let stop_flag = stop_flag.clone();
                let exited = exited.clone();
                move || {
                    pump_loop(stream, ctx, stop_flag, &exited);
                    exited.store(true, Ordering::SeqCst);
                }
            })
            .map_err(|e| CameraError::CaptureFailed(format!("frame pump thread: {e}")))?;

        Ok(Self {
            stop_flag,
            exited,
            thread: Some(thread),
        })
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::error!("Frame pump thread panicked"),
                Err(e) => log::warn!("Joining frame pump failed: {}", e),
            }
        }
    }
}

fn pump_loop(
    stream: SharedStream,
    ctx: PumpContext,
    stop_flag: Arc<AtomicBool>,
    exited: &AtomicBool,
) {
    log::debug!("Frame pump for {} started", ctx.label);
    let mut sequence: u64 = 0;
    let mut consecutive_errors = 0u32;

    while !stop_flag.load(Ordering::SeqCst) {
        let preview = ctx.targets.delivers_preview();
        if !preview && !ctx.targets.has_recording() {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        let captured = lock_stream(&stream).and_then(|mut s| s.capture_frame());
        match captured {
            Ok(mut frame) => {
                consecutive_errors = 0;
                frame.sequence = sequence;
                sequence = sequence.wrapping_add(1);
                ctx.tags.apply(&mut frame);
                record_frame(&ctx, &frame);
                if !preview {
                    continue;
                }

                let frame = match convert_pixels(frame, ctx.pixel_format) {
                    Ok(frame) => frame,
                    Err(e) => {
                        ctx.events.send(CameraEvent::DeviceError {
                            code: e.code().to_string(),
                            message: e.message().to_string(),
                        });
                        continue;
                    }
                };
                if let Err(e) = ctx.handler.deliver(frame, &stop_flag) {
                    log::warn!("Frame delivery failed on {}: {}", ctx.label, e);
                    break;
                }
            }
            Err(CameraError::SessionInterrupted(message)) => {
                log::warn!("Session on {} interrupted: {}", ctx.label, message);
                // Queue the state change and mark the pump dead before the
                // host hears about it, so its next call sees both.
                if let Err(e) = ctx.queue.dispatch(|session| session.mark_interrupted()) {
                    log::debug!("Could not record interruption: {}", e);
                }
                exited.store(true, Ordering::SeqCst);
                ctx.events.send(CameraEvent::SessionInterrupted { message });
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                log::warn!("Frame capture failed on {}: {}", ctx.label, e);
                ctx.events.send(CameraEvent::DeviceError {
                    code: e.code().to_string(),
                    message: e.message().to_string(),
                });
                if consecutive_errors >= MAX_PUMP_ERRORS {
                    log::error!("Frame pump for {} giving up", ctx.label);
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    log::debug!("Frame pump for {} stopped after {} frames", ctx.label, sequence);
}

/// Hand a frame to the active recording, if any.
fn record_frame(ctx: &PumpContext, frame: &CameraFrame) {
    let failure = match ctx.targets.recording.lock() {
        Ok(mut recording) => recording.as_mut().and_then(|r| r.push(frame)),
        Err(_) => Some(CameraError::poisoned_lock()),
    };
    if let Some(e) = failure {
        log::warn!("Recording on {} failed: {}", ctx.label, e);
        ctx.events.send(CameraEvent::DeviceError {
            code: e.code().to_string(),
            message: e.message().to_string(),
        });
    }
}

/// Convert a frame into the stream's pixel format.
fn convert_pixels(frame: CameraFrame, target: PixelFormat) -> Result<CameraFrame, CameraError> {
    if frame.pixel_format == target {
        return Ok(frame);
    }
    match (frame.pixel_format, target) {
        (PixelFormat::Rgb24, PixelFormat::Bgra32) => {
            let data: Vec<u8> = frame
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0], 255])
                .collect();
            let mut converted = frame;
            converted.data = data.into();
            converted.pixel_format = PixelFormat::Bgra32;
            Ok(converted)
        }
        (source, target) => Err(CameraError::ConfigurationNotSupported(format!(
            "cannot convert {source} frames to {target}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_video_frame;

    #[test]
    fn test_convert_rgb_to_bgra() {
        let frame = synthetic_video_frame(0, 2, 1);
        let rgb = frame.data.clone();
        let converted = convert_pixels(frame, PixelFormat::Bgra32).unwrap();
        assert_eq!(converted.pixel_format, PixelFormat::Bgra32);
        assert_eq!(converted.data.len(), 8);
        assert_eq!(&converted.data[..4], &[rgb[2], rgb[1], rgb[0], 255]);
    }

    #[test]
    fn test_convert_same_format_is_identity() {
        let frame = synthetic_video_frame(3, 4, 4);
        let data = frame.data.clone();
        assert_eq!(convert_pixels(frame, PixelFormat::Rgb24).unwrap().data, data);
    }

    #[test]
    fn test_unsupported_conversion() {
        let frame = synthetic_video_frame(0, 2, 2);
        assert!(convert_pixels(frame, PixelFormat::Nv12).is_err());
    }

    #[test]
    fn test_frame_tags_applied() {
        let tags = FrameTags::default();
        tags.set(90, true);
        let mut frame = synthetic_video_frame(0, 2, 2);
        tags.apply(&mut frame);
        assert_eq!(frame.rotation_degrees, 90);
        assert!(frame.mirrored);
    }
}
