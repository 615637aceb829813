//! Camera properties exchanged with the host: capture modes, presets and
//! orientation.

use crate::types::Resolution;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlashMode {
    #[default]
    Off,
    Auto,
    Always,
    Torch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FocusMode {
    #[default]
    Auto,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExposureMode {
    #[default]
    Auto,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoStabilization {
    #[default]
    Off,
    Standard,
    Cinematic,
}

/// Quality preset translated into a concrete capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionPreset {
    Low,
    Medium,
    #[default]
    High,
    VeryHigh,
    UltraHigh,
    /// Largest resolution the device offers.
    Max,
}

impl ResolutionPreset {
    /// Target resolution, `None` for [`ResolutionPreset::Max`].
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            ResolutionPreset::Low => Some(Resolution::new(352, 288)),
            ResolutionPreset::Medium => Some(Resolution::new(640, 480)),
            ResolutionPreset::High => Some(Resolution::new(1280, 720)),
            ResolutionPreset::VeryHigh => Some(Resolution::new(1920, 1080)),
            ResolutionPreset::UltraHigh => Some(Resolution::new(3840, 2160)),
            ResolutionPreset::Max => None,
        }
    }
}

impl FromStr for ResolutionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" | "288p" => Ok(Self::Low),
            "medium" | "480p" => Ok(Self::Medium),
            "high" | "720p" => Ok(Self::High),
            "veryHigh" | "1080p" => Ok(Self::VeryHigh),
            "ultraHigh" | "2160p" | "4k" => Ok(Self::UltraHigh),
            "max" => Ok(Self::Max),
            other => Err(format!("unknown resolution preset: {other}")),
        }
    }
}

/// Orientation of the device relative to its natural (portrait) position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOrientation {
    #[default]
    PortraitUp,
    PortraitDown,
    LandscapeLeft,
    LandscapeRight,
}

impl DeviceOrientation {
    /// Clockwise rotation to bring a landscape sensor image upright.
    pub fn rotation_degrees(&self) -> u16 {
        match self {
            DeviceOrientation::PortraitUp => 90,
            DeviceOrientation::LandscapeLeft => 0,
            DeviceOrientation::PortraitDown => 270,
            DeviceOrientation::LandscapeRight => 180,
        }
    }
}

impl FromStr for DeviceOrientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portraitUp" => Ok(Self::PortraitUp),
            "portraitDown" => Ok(Self::PortraitDown),
            "landscapeLeft" => Ok(Self::LandscapeLeft),
            "landscapeRight" => Ok(Self::LandscapeRight),
            other => Err(format!("unknown orientation: {other}")),
        }
    }
}

/// Still image container written by the photo output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageFileFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFileFormat::Jpeg => "jpg",
            ImageFileFormat::Png => "png",
        }
    }
}

impl FromStr for ImageFileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            other => Err(format!("unknown image format: {other}")),
        }
    }
}

/// Focus, exposure, flash and zoom state applied to the active device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceControls {
    pub flash_mode: FlashMode,
    pub focus_mode: FocusMode,
    pub exposure_mode: ExposureMode,
    pub zoom_level: f32,
}

impl Default for DeviceControls {
    fn default() -> Self {
        Self {
            flash_mode: FlashMode::Off,
            focus_mode: FocusMode::Auto,
            exposure_mode: ExposureMode::Auto,
            zoom_level: 1.0,
        }
    }
}
