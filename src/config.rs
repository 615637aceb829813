//! Configuration management for camcore
//!
//! Loads and saves the TOML file holding session defaults, stream
//! backpressure, photo storage, video recording and permission behaviour.

use crate::errors::CameraError;
use crate::media_settings::MediaSettings;
use crate::properties::{ImageFileFormat, ResolutionPreset};
use crate::recording::DEFAULT_VIDEO_BITRATE;
use crate::stream::BufferPolicy;
use crate::types::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CamCoreConfig {
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub recording: RecordingConfig,
    pub permissions: PermissionsConfig,
}

/// Defaults applied when a camera is opened without explicit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub resolution_preset: ResolutionPreset,
    /// Requested frame rate; the device default is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_per_second: Option<f64>,
    pub enable_audio: bool,
    /// How long `close` waits for in-flight photos before failing them
    pub close_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    #[default]
    DropOldest,
    Block,
}

/// Image stream delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub backpressure: Backpressure,
    /// Frames buffered before the policy applies
    pub buffer_capacity: usize,
    pub pixel_format: PixelFormat,
}

/// Photo file placement and encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_directory: String,
    /// Put photos in `YYYY-MM-DD` subdirectories
    pub organize_by_date: bool,
    pub image_format: ImageFileFormat,
    pub jpeg_quality: u8,
}

/// Movie files go to the storage output directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Bits per second
    pub video_bitrate: u32,
    pub fast_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Prompt when access was never decided; otherwise opening fails
    pub auto_request: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resolution_preset: ResolutionPreset::High,
            frames_per_second: None,
            enable_audio: false,
            close_timeout_ms: 2000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backpressure: Backpressure::DropOldest,
            buffer_capacity: 2,
            pixel_format: PixelFormat::Rgb24,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_directory: "./captures".to_string(),
            organize_by_date: true,
            image_format: ImageFileFormat::Jpeg,
            jpeg_quality: 90,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            video_bitrate: DEFAULT_VIDEO_BITRATE,
            fast_start: true,
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self { auto_request: true }
    }
}

impl CamCoreConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CameraError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CameraError::Config(format!("Failed to read config file: {}", e)))?;

        let config: CamCoreConfig = toml::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CameraError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CameraError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CameraError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("camcore.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), CameraError> {
        if let Some(fps) = self.session.frames_per_second {
            if !(fps > 0.0 && fps <= 240.0) {
                return Err(CameraError::Config(
                    "Invalid frames_per_second (must be 1-240)".to_string(),
                ));
            }
        }
        if self.stream.buffer_capacity == 0 {
            return Err(CameraError::Config(
                "Stream buffer capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.jpeg_quality == 0 || self.storage.jpeg_quality > 100 {
            return Err(CameraError::Config(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }
        if self.storage.output_directory.trim().is_empty() {
            return Err(CameraError::Config(
                "Output directory must not be empty".to_string(),
            ));
        }
        if self.recording.video_bitrate == 0 {
            return Err(CameraError::Config(
                "Video bitrate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Media settings used when a camera is opened without its own.
    pub fn media_settings(&self) -> MediaSettings {
        MediaSettings {
            resolution_preset: self.session.resolution_preset,
            frames_per_second: self.session.frames_per_second,
            stream_pixel_format: self.stream.pixel_format,
            image_format: self.storage.image_format,
            jpeg_quality: self.storage.jpeg_quality,
            enable_audio: self.session.enable_audio,
        }
    }

    pub fn buffer_policy(&self) -> BufferPolicy {
        let capacity = self.stream.buffer_capacity;
        match self.stream.backpressure {
            Backpressure::DropOldest => BufferPolicy::DropOldest { capacity },
            Backpressure::Block => BufferPolicy::Block { capacity },
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.session.close_timeout_ms)
    }

    pub fn output_directory(&self) -> PathBuf {
        PathBuf::from(&self.storage.output_directory)
    }
}
