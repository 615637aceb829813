use crate::properties::{FlashMode, ImageFileFormat};
use crate::stream::BufferPolicy;
use crate::types::PixelFormat;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OutputId(pub u32);

/// Still image output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoOutput {
    pub image_format: ImageFileFormat,
    pub jpeg_quality: u8,
    pub flash_mode: FlashMode,
}

impl Default for PhotoOutput {
    fn default() -> Self {
        Self {
            image_format: ImageFileFormat::Jpeg,
            jpeg_quality: 90,
            flash_mode: FlashMode::Off,
        }
    }
}

/// Streaming frame output feeding the image stream handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoDataOutput {
    pub pixel_format: PixelFormat,
    pub buffer_policy: BufferPolicy,
    /// Whether frames are currently delivered to the consumer.
    pub streaming: bool,
}

impl Default for VideoDataOutput {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Rgb24,
            buffer_policy: BufferPolicy::default(),
            streaming: false,
        }
    }
}

/// Movie file output. Fed from the same frames as the video data output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovieOutput {
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Whether a recording is currently being written.
    pub recording: bool,
}

impl Default for MovieOutput {
    fn default() -> Self {
        Self {
            bitrate: crate::recording::DEFAULT_VIDEO_BITRATE,
            recording: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CaptureOutput {
    Photo(PhotoOutput),
    VideoData(VideoDataOutput),
    Movie(MovieOutput),
}

impl CaptureOutput {
    pub fn photo() -> Self {
        CaptureOutput::Photo(PhotoOutput::default())
    }

    pub fn video_data() -> Self {
        CaptureOutput::VideoData(VideoDataOutput::default())
    }

    pub fn movie() -> Self {
        CaptureOutput::Movie(MovieOutput::default())
    }

    pub fn is_video_data(&self) -> bool {
        matches!(self, CaptureOutput::VideoData(_))
    }

    /// Outputs whose connections carry a stabilization mode.
    pub fn is_video(&self) -> bool {
        matches!(self, CaptureOutput::VideoData(_) | CaptureOutput::Movie(_))
    }

    /// Whether the output can consume frames produced in `source`.
    pub fn accepts(&self, source: PixelFormat) -> bool {
        match self {
            CaptureOutput::Photo(_) | CaptureOutput::Movie(_) => {
                source.bytes_per_pixel().is_some()
            }
            CaptureOutput::VideoData(video) => source.converts_to(video.pixel_format),
        }
    }
}
