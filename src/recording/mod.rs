//! Video recording from the camera's frame stream.
//!
//! Frames captured while a recording is active are handed to a
//! [`VideoWriter`]. With the `recording` feature the default writer encodes
//! H.264 with openh264 and muxes MP4 with muxide; without it the default
//! factory refuses to start and callers can plug in their own writer.
//!
//! # Example
//! ```rust,ignore
//! use camcore::recording::{default_writer_factory, RecordingSettings};
//!
//! let settings = RecordingSettings::new(1280, 720, 30.0);
//! let mut writer = default_writer_factory().create(&path, &settings)?;
//! writer.write_frame(&frame)?;
//! let stats = writer.finish()?;
//! ```

#[cfg(feature = "recording")]
mod mp4;

#[cfg(feature = "recording")]
pub use mp4::{EncodedFrame, H264Encoder, Mp4VideoWriter, Mp4WriterFactory};

use crate::errors::CameraError;
use crate::properties::VideoStabilization;
use crate::types::CameraFrame;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Bitrate used when the configuration does not name one.
pub const DEFAULT_VIDEO_BITRATE: u32 = 5_000_000;

/// Encoding parameters for one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Write the index before the media data
    pub fast_start: bool,
    pub stabilization: VideoStabilization,
}

impl RecordingSettings {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate: DEFAULT_VIDEO_BITRATE,
            fast_start: true,
            stabilization: VideoStabilization::Off,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_fast_start(mut self, enabled: bool) -> Self {
        self.fast_start = enabled;
        self
    }

    pub fn with_stabilization(mut self, stabilization: VideoStabilization) -> Self {
        self.stabilization = stabilization;
        self
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "cannot record {}x{}: dimensions must be even and non-zero",
                self.width, self.height
            )));
        }
        if !(self.fps > 0.0) {
            return Err(CameraError::ConfigurationNotSupported(format!(
                "cannot record at {} fps",
                self.fps
            )));
        }
        if self.bitrate == 0 {
            return Err(CameraError::ConfigurationNotSupported(
                "recording bitrate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Summary returned when a recording is finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStats {
    pub path: PathBuf,
    pub video_frames: u64,
    /// Frames skipped while paused or rejected by the encoder
    pub skipped_frames: u64,
    pub duration_secs: f64,
    pub bytes_written: u64,
}

/// Sink for the frames of one recording.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, frame: &CameraFrame) -> Result<(), CameraError>;

    /// Frames accepted so far.
    fn frame_count(&self) -> u64;

    /// Flush and close the file.
    fn finish(self: Box<Self>) -> Result<RecordingStats, CameraError>;
}

/// Creates a [`VideoWriter`] per recording.
pub trait VideoWriterFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        settings: &RecordingSettings,
    ) -> Result<Box<dyn VideoWriter>, CameraError>;
}

/// Factory used when the crate is built without an encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedWriterFactory;

impl VideoWriterFactory for UnsupportedWriterFactory {
    fn create(
        &self,
        _path: &Path,
        _settings: &RecordingSettings,
    ) -> Result<Box<dyn VideoWriter>, CameraError> {
        Err(CameraError::ConfigurationNotSupported(
            "video recording needs the `recording` feature".to_string(),
        ))
    }
}

#[cfg(feature = "recording")]
pub fn default_writer_factory() -> Arc<dyn VideoWriterFactory> {
    Arc::new(Mp4WriterFactory)
}

#[cfg(not(feature = "recording"))]
pub fn default_writer_factory() -> Arc<dyn VideoWriterFactory> {
    Arc::new(UnsupportedWriterFactory)
}

/// `<dir>[/<YYYY-MM-DD>]/VID_<YYYYMMDD_HHMMSS_mmm>_<id prefix>.mp4`
pub fn recording_path(
    output_directory: &Path,
    date_subdirectories: bool,
    id: Uuid,
    now: DateTime<Local>,
) -> PathBuf {
    let mut dir = output_directory.to_path_buf();
    if date_subdirectories {
        dir.push(now.format("%Y-%m-%d").to_string());
    }
    let short_id: String = id.simple().to_string().chars().take(8).collect();
    dir.join(format!(
        "VID_{}_{}.mp4",
        now.format("%Y%m%d_%H%M%S_%3f"),
        short_id
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingState {
    Recording,
    Paused,
    /// The writer rejected a frame; stopping reports the error.
    Failed,
}

/// A recording in progress, fed by the frame pump.
pub struct ActiveRecording {
    path: PathBuf,
    writer: Box<dyn VideoWriter>,
    state: RecordingState,
    error: Option<CameraError>,
    skipped: u64,
    started: Instant,
}

impl ActiveRecording {
    pub fn new(path: PathBuf, writer: Box<dyn VideoWriter>) -> Self {
        Self {
            path,
            writer,
            state: RecordingState::Recording,
            error: None,
            skipped: 0,
            started: Instant::now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn frame_count(&self) -> u64 {
        self.writer.frame_count()
    }

    pub fn set_paused(&mut self, paused: bool) -> Result<(), CameraError> {
        self.state = match (self.state, paused) {
            (RecordingState::Failed, _) => {
                return Err(CameraError::CaptureFailed(
                    self.error
                        .as_ref()
                        .map(|e| e.message().to_string())
                        .unwrap_or_else(|| "recording failed".to_string()),
                ))
            }
            (_, true) => RecordingState::Paused,
            (_, false) => RecordingState::Recording,
        };
        Ok(())
    }

    /// Feed one frame. Returns the writer error the first time it fails so
    /// the caller can report it; later frames are skipped.
    pub fn push(&mut self, frame: &CameraFrame) -> Option<CameraError> {
        if self.state != RecordingState::Recording {
            self.skipped += 1;
            return None;
        }
        match self.writer.write_frame(frame) {
            Ok(()) => None,
            Err(e) => {
                self.state = RecordingState::Failed;
                self.error = Some(e.clone());
                Some(e)
            }
        }
    }

    /// Close the writer. A recording whose writer failed still closes its
    /// file, then reports the failure.
    pub fn finish(self) -> Result<RecordingStats, CameraError> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let skipped = self.skipped;
        let error = self.error;
        let mut stats = self.writer.finish()?;
        if let Some(e) = error {
            return Err(CameraError::CaptureFailed(format!(
                "recording {} failed: {}",
                stats.path.display(),
                e.message()
            )));
        }
        stats.skipped_frames += skipped;
        if stats.duration_secs == 0.0 {
            stats.duration_secs = elapsed;
        }
        Ok(stats)
    }
}
