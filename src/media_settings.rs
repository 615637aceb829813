//! Translate requested media settings into a concrete device format.

use crate::errors::CameraError;
use crate::properties::{ImageFileFormat, ResolutionPreset};
use crate::types::{CameraDeviceInfo, CameraFormat, PixelFormat, ResolvedFormat};
use serde::{Deserialize, Serialize};

/// Frame rate chosen when the caller does not ask for one.
pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaSettings {
    pub resolution_preset: ResolutionPreset,
    pub frames_per_second: Option<f64>,
    /// Pixel format delivered to the image stream.
    pub stream_pixel_format: PixelFormat,
    pub image_format: ImageFileFormat,
    pub jpeg_quality: u8,
    pub enable_audio: bool,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            resolution_preset: ResolutionPreset::High,
            frames_per_second: None,
            stream_pixel_format: PixelFormat::Rgb24,
            image_format: ImageFileFormat::Jpeg,
            jpeg_quality: 90,
            enable_audio: false,
        }
    }
}

impl MediaSettings {
    pub fn new(resolution_preset: ResolutionPreset) -> Self {
        Self {
            resolution_preset,
            ..Self::default()
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.frames_per_second = Some(fps);
        self
    }

    pub fn with_audio(mut self, enable_audio: bool) -> Self {
        self.enable_audio = enable_audio;
        self
    }

    pub fn with_stream_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.stream_pixel_format = pixel_format;
        self
    }

    pub fn with_image_format(mut self, image_format: ImageFileFormat) -> Self {
        self.image_format = image_format;
        self
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        if let Some(fps) = self.frames_per_second {
            if !(fps > 0.0 && fps <= 240.0) {
                return Err(CameraError::ConfigurationNotSupported(format!(
                    "frame rate {fps} outside 1-240"
                )));
            }
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(CameraError::ConfigurationNotSupported(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve against the device's formats.
    pub fn resolve(&self, device: &CameraDeviceInfo) -> Result<ResolvedFormat, CameraError> {
        self.validate()?;
        select_format(
            &device.formats,
            self.resolution_preset,
            self.frames_per_second,
            self.stream_pixel_format,
        )
        .ok_or_else(|| {
            CameraError::ConfigurationNotSupported(format!(
                "device {} has no format for {:?}{}",
                device.id,
                self.resolution_preset,
                self.frames_per_second
                    .map(|fps| format!(" at {fps} fps"))
                    .unwrap_or_default()
            ))
        })
    }
}

/// Pick the device format for a preset.
///
/// Exact presets need a format with exactly that resolution; `Max` takes the
/// largest. A requested rate must fall in one of the format's ranges. Without
/// one, 30 fps is used when supported, else the format's highest rate. Among
/// equal candidates the one convertible to `stream_pixel_format` wins, then
/// the higher rate.
pub fn select_format(
    formats: &[CameraFormat],
    preset: ResolutionPreset,
    fps: Option<f64>,
    stream_pixel_format: PixelFormat,
) -> Option<ResolvedFormat> {
    let target = preset.resolution();
    let max_area = formats.iter().map(|f| f.resolution.area()).max()?;

    formats
        .iter()
        .filter(|f| match target {
            Some(res) => f.resolution == res,
            None => f.resolution.area() == max_area,
        })
        .filter_map(|f| {
            let chosen = match fps {
                Some(requested) => f.supports_fps(requested).then_some(requested)?,
                None if f.supports_fps(DEFAULT_FPS) => DEFAULT_FPS,
                None => f.max_fps(),
            };
            Some(ResolvedFormat {
                format: f.clone(),
                fps: chosen,
            })
        })
        .max_by(|a, b| {
            let a_converts = a.format.pixel_format.converts_to(stream_pixel_format);
            let b_converts = b.format.pixel_format.converts_to(stream_pixel_format);
            a_converts
                .cmp(&b_converts)
                .then(a.fps.total_cmp(&b.fps))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{back_camera, front_camera};
    use crate::types::FrameRateRange;

    #[test]
    fn test_1080p_on_720p_device_is_not_supported() {
        let settings = MediaSettings::new(ResolutionPreset::VeryHigh).with_fps(30.0);
        let err = settings.resolve(&front_camera()).unwrap_err();
        assert!(matches!(err, CameraError::ConfigurationNotSupported(_)));
    }

    #[test]
    fn test_720p_on_720p_device() {
        let resolved = MediaSettings::new(ResolutionPreset::High)
            .with_fps(30.0)
            .resolve(&front_camera())
            .unwrap();
        assert_eq!(resolved.format.resolution.height, 720);
        assert_eq!(resolved.fps, 30.0);
    }

    #[test]
    fn test_max_picks_largest() {
        let resolved = MediaSettings::new(ResolutionPreset::Max)
            .resolve(&back_camera())
            .unwrap();
        assert_eq!(resolved.format.resolution.width, 1920);
    }

    #[test]
    fn test_unsupported_fps_rejected() {
        let err = MediaSettings::new(ResolutionPreset::High)
            .with_fps(120.0)
            .resolve(&front_camera())
            .unwrap_err();
        assert!(matches!(err, CameraError::ConfigurationNotSupported(_)));
    }

    #[test]
    fn test_default_fps_falls_back_to_max() {
        let formats = vec![CameraFormat::new(1280, 720, 15.0)
            .with_frame_rate_ranges(vec![FrameRateRange::new(5.0, 15.0)])];
        let resolved =
            select_format(&formats, ResolutionPreset::High, None, PixelFormat::Rgb24).unwrap();
        assert_eq!(resolved.fps, 15.0);
    }

    #[test]
    fn test_prefers_convertible_pixel_format() {
        let formats = vec![
            CameraFormat::new(1280, 720, 60.0).with_pixel_format(PixelFormat::Mjpeg),
            CameraFormat::new(1280, 720, 30.0).with_pixel_format(PixelFormat::Rgb24),
        ];
        let resolved =
            select_format(&formats, ResolutionPreset::High, None, PixelFormat::Bgra32).unwrap();
        assert_eq!(resolved.format.pixel_format, PixelFormat::Rgb24);
    }

    #[test]
    fn test_invalid_quality_rejected() {
        let mut settings = MediaSettings::default();
        settings.jpeg_quality = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_format_list() {
        assert!(select_format(&[], ResolutionPreset::Max, None, PixelFormat::Rgb24).is_none());
    }
}
