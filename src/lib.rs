//! camcore: camera session management core
//!
//! Device discovery, permission gating, a capture-session graph with a scoped
//! configuration lock, a per-device camera controller, exactly-once photo
//! capture, video recording and frame/event streaming with backpressure.
//!
//! Hardware sits behind [`platform::CaptureBackend`]. The default build ships
//! the in-memory [`platform::SyntheticBackend`]; the `native` feature adds a
//! `nokhwa` backend, and the `recording` feature adds an H.264/MP4 writer.
//!
//! # Usage
//! ```rust,no_run
//! use camcore::{Camera, CameraEnvironment, MediaSettings, ResolutionPreset};
//! use camcore::permissions::FixedPermissions;
//! use camcore::platform::SyntheticBackend;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), camcore::CameraError> {
//! let env = CameraEnvironment::new(
//!     Arc::new(SyntheticBackend::with_default_devices()),
//!     Arc::new(FixedPermissions::authorized()),
//! );
//! let camera = Camera::open("synthetic-back", MediaSettings::new(ResolutionPreset::High), env).await?;
//! let path = camera.take_picture().await?;
//! println!("saved {}", path.display());
//! camera.close().await?;
//! # Ok(())
//! # }
//! ```
pub mod camera;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod host;
pub mod media_settings;
pub mod orientation;
pub mod permissions;
pub mod photo;
pub mod platform;
pub mod properties;
pub mod recording;
pub mod session;
pub mod stream;
pub mod types;

// Synthetic data for offline testing
pub mod testing;

// Re-exports for convenience
pub use camera::{Camera, CameraEnvironment};
pub use config::CamCoreConfig;
pub use discovery::{DeviceDiscovery, DeviceEvent, DeviceMonitor};
pub use errors::{CameraError, CameraResult};
pub use host::{CameraHost, CameraId, HostError, HostRequest, HostResponse};
pub use media_settings::MediaSettings;
pub use permissions::{PermissionManager, PermissionStatus};
pub use photo::PhotoCaptureRequest;
pub use properties::{
    DeviceOrientation, ExposureMode, FlashMode, FocusMode, ImageFileFormat, ResolutionPreset,
    VideoStabilization,
};
pub use recording::{RecordingSettings, RecordingState, RecordingStats, VideoWriterFactory};
pub use session::{CaptureSession, SessionState};
pub use stream::{BufferPolicy, CameraEvent, EventChannel, ImageStreamHandler};
pub use types::{
    CameraDeviceInfo, CameraFormat, CameraFrame, DevicePosition, MediaType, PixelFormat, Platform,
};

/// Detect the current platform using the Platform enum
pub fn current_platform() -> Platform {
    Platform::current()
}

/// Initialize logging for the camera system
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "camcore=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
/// `major * 10_000 + minor * 100 + patch`
pub const VERSION_NUMBER: u32 = parse_u32(env!("CARGO_PKG_VERSION_MAJOR")) * 10_000
    + parse_u32(env!("CARGO_PKG_VERSION_MINOR")) * 100
    + parse_u32(env!("CARGO_PKG_VERSION_PATCH"));
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

const fn parse_u32(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION_STRING.to_string(),
        version_number: VERSION_NUMBER,
        description: DESCRIPTION.to_string(),
        platform: Platform::current(),
        native_backend: cfg!(feature = "native"),
        recording: cfg!(feature = "recording"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub version_number: u32,
    pub description: String,
    pub platform: Platform,
    pub native_backend: bool,
    pub recording: bool,
}
