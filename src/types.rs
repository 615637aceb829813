//! Core value types shared by discovery, the session graph and the controller.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
            Platform::Unknown => "unknown",
        }
    }
}

/// Kind of capture hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaType {
    Video,
    Audio,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
        }
    }
}

/// Physical placement of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DevicePosition {
    Back,
    Front,
    External,
}

impl fmt::Display for DevicePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePosition::Back => write!(f, "back"),
            DevicePosition::Front => write!(f, "front"),
            DevicePosition::External => write!(f, "external"),
        }
    }
}

/// Pixel layout tag of a device format or delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PixelFormat {
    Rgb24,
    Bgra32,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats. Nv12 and Mjpeg are not packed.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Bgra32 => Some(4),
            PixelFormat::Nv12 | PixelFormat::Mjpeg => None,
        }
    }

    /// Whether frames in `self` can be converted into `target` by the core.
    pub fn converts_to(&self, target: PixelFormat) -> bool {
        *self == target || matches!((self, target), (PixelFormat::Rgb24, PixelFormat::Bgra32))
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rgb24" | "rgb" | "rgb8" => Ok(Self::Rgb24),
            "bgra32" | "bgra" | "bgra8888" => Ok(Self::Bgra32),
            "nv12" | "yuv420" => Ok(Self::Nv12),
            "mjpeg" | "mjpg" => Ok(Self::Mjpeg),
            other => Err(format!("unknown pixel format: {other}")),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgra32 => "bgra32",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Mjpeg => "mjpeg",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRateRange {
    pub min_fps: f64,
    pub max_fps: f64,
}

impl FrameRateRange {
    pub fn new(min_fps: f64, max_fps: f64) -> Self {
        Self { min_fps, max_fps }
    }

    pub fn fixed(fps: f64) -> Self {
        Self::new(fps, fps)
    }

    pub fn contains(&self, fps: f64) -> bool {
        fps >= self.min_fps && fps <= self.max_fps
    }
}

/// A hardware mode of a capture device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFormat {
    pub resolution: Resolution,
    pub frame_rate_ranges: Vec<FrameRateRange>,
    pub pixel_format: PixelFormat,
}

impl CameraFormat {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            frame_rate_ranges: vec![FrameRateRange::new(1.0, fps)],
            pixel_format: PixelFormat::Rgb24,
        }
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn with_frame_rate_ranges(mut self, ranges: Vec<FrameRateRange>) -> Self {
        self.frame_rate_ranges = ranges;
        self
    }

    pub fn supports_fps(&self, fps: f64) -> bool {
        self.frame_rate_ranges.iter().any(|r| r.contains(fps))
    }

    pub fn max_fps(&self) -> f64 {
        self.frame_rate_ranges
            .iter()
            .map(|r| r.max_fps)
            .fold(0.0, f64::max)
    }

    /// 1280x720@30 RGB
    pub fn hd() -> Self {
        Self::new(1280, 720, 30.0)
    }

    /// 1920x1080@30 RGB
    pub fn full_hd() -> Self {
        Self::new(1920, 1080, 30.0)
    }
}

impl fmt::Display for CameraFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.resolution, self.max_fps(), self.pixel_format)
    }
}

/// A device format resolved against requested settings, with the chosen rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFormat {
    pub format: CameraFormat,
    pub fps: f64,
}

/// Snapshot of one capture device as reported by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDeviceInfo {
    pub id: String,
    pub name: String,
    pub position: DevicePosition,
    pub media_type: MediaType,
    pub formats: Vec<CameraFormat>,
    pub has_flash: bool,
    pub has_torch: bool,
    pub min_zoom: f32,
    pub max_zoom: f32,
}

impl CameraDeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: DevicePosition::External,
            media_type: MediaType::Video,
            formats: Vec::new(),
            has_flash: false,
            has_torch: false,
            min_zoom: 1.0,
            max_zoom: 1.0,
        }
    }

    pub fn with_position(mut self, position: DevicePosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    pub fn with_formats(mut self, formats: Vec<CameraFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_flash(mut self, has_flash: bool, has_torch: bool) -> Self {
        self.has_flash = has_flash;
        self.has_torch = has_torch;
        self
    }

    pub fn with_zoom_range(mut self, min_zoom: f32, max_zoom: f32) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }
}

/// A captured frame as delivered to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct CameraFrame {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub device_id: String,
    /// Clockwise rotation the consumer should apply for display.
    pub rotation_degrees: u16,
    pub mirrored: bool,
    #[serde(skip)]
    pub data: Bytes,
}

impl CameraFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, device_id: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            timestamp_us: 0,
            width,
            height,
            pixel_format: PixelFormat::Rgb24,
            device_id: device_id.into(),
            rotation_degrees: 0,
            mirrored: false,
            data: data.into(),
        }
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}
