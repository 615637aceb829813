//! Hardware backend built on nokhwa (V4L2, AVFoundation, Media Foundation).

use super::{CaptureBackend, DeviceStream};
use crate::errors::CameraError;
use crate::properties::DeviceControls;
use crate::types::{
    CameraDeviceInfo, CameraFormat, CameraFrame, DevicePosition, FrameRateRange, MediaType,
    PixelFormat, ResolvedFormat,
};
use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution},
    CallbackCamera,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Formats assumed when the driver cannot be queried without opening it.
fn common_formats() -> Vec<CameraFormat> {
    vec![
        CameraFormat::new(1920, 1080, 30.0),
        CameraFormat::new(1280, 720, 30.0),
        CameraFormat::new(640, 480, 30.0),
    ]
}

fn parse_index(device_id: &str) -> Result<u32, CameraError> {
    device_id
        .parse::<u32>()
        .map_err(|_| CameraError::DeviceUnavailable(format!("invalid device id: {device_id}")))
}

#[derive(Debug, Default)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    pub fn new() -> Self {
        Self
    }

    /// Query the driver for its formats. Frames are decoded to RGB, so every
    /// format is reported as Rgb24 and grouped by resolution.
    fn query_formats(index: u32) -> Result<Vec<CameraFormat>, CameraError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = CallbackCamera::new(CameraIndex::Index(index), requested, |_| {})
            .map_err(|e| CameraError::DeviceUnavailable(format!("Failed to open camera: {}", e)))?;
        let formats = camera
            .compatible_camera_formats()
            .map_err(|e| CameraError::DeviceUnavailable(format!("Failed to query formats: {}", e)))?;

        let mut by_resolution: BTreeMap<(u32, u32), Vec<FrameRateRange>> = BTreeMap::new();
        for format in formats {
            let res = format.resolution();
            by_resolution
                .entry((res.width_x, res.height_y))
                .or_default()
                .push(FrameRateRange::fixed(format.frame_rate() as f64));
        }

        Ok(by_resolution
            .into_iter()
            .rev()
            .map(|((w, h), ranges)| {
                CameraFormat::new(w, h, 30.0)
                    .with_pixel_format(PixelFormat::Rgb24)
                    .with_frame_rate_ranges(ranges)
            })
            .collect())
    }
}

impl CaptureBackend for NokhwaBackend {
    fn name(&self) -> &str {
        "nokhwa"
    }

    fn list_devices(&self, media_type: MediaType) -> Result<Vec<CameraDeviceInfo>, CameraError> {
        if media_type == MediaType::Audio {
            return Ok(Vec::new());
        }

        let cameras = query(ApiBackend::Auto)
            .map_err(|e| CameraError::DeviceUnavailable(format!("Failed to query cameras: {}", e)))?;

        let mut devices = Vec::new();
        for info in cameras {
            let id = info.index().to_string();
            let formats = match parse_index(&id).and_then(Self::query_formats) {
                Ok(formats) if !formats.is_empty() => formats,
                Ok(_) => common_formats(),
                Err(e) => {
                    log::debug!("Format query for camera {} failed, using defaults: {}", id, e);
                    common_formats()
                }
            };
            devices.push(
                CameraDeviceInfo::new(id, info.human_name())
                    .with_position(DevicePosition::External)
                    .with_formats(formats),
            );
        }
        Ok(devices)
    }

    fn open_device(
        &self,
        device: &CameraDeviceInfo,
        format: &ResolvedFormat,
    ) -> Result<Box<dyn DeviceStream>, CameraError> {
        let index = parse_index(&device.id)?;
        let resolution = format.format.resolution;
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            nokhwa::utils::CameraFormat::new(
                Resolution::new(resolution.width, resolution.height),
                FrameFormat::MJPEG,
                format.fps as u32,
            ),
        ));

        let camera = CallbackCamera::new(CameraIndex::Index(index), requested, |_| {})
            .map_err(|e| CameraError::DeviceUnavailable(format!("Failed to initialize camera: {}", e)))?;

        Ok(Box::new(NokhwaStream {
            camera: Arc::new(Mutex::new(camera)),
            device_id: device.id.clone(),
            streaming: false,
        }))
    }
}

struct NokhwaStream {
    camera: Arc<Mutex<CallbackCamera>>,
    device_id: String,
    streaming: bool,
}

impl NokhwaStream {
    fn camera(&self) -> Result<std::sync::MutexGuard<'_, CallbackCamera>, CameraError> {
        self.camera
            .lock()
            .map_err(|_| CameraError::CaptureFailed("Failed to lock camera".to_string()))
    }
}

impl DeviceStream for NokhwaStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn start_stream(&mut self) -> Result<(), CameraError> {
        if self.streaming {
            return Ok(());
        }
        self.camera()?
            .open_stream()
            .map_err(|e| CameraError::DeviceUnavailable(format!("Failed to start stream: {}", e)))?;
        self.streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CameraError> {
        if !self.streaming {
            return Ok(());
        }
        self.camera()?
            .stop_stream()
            .map_err(|e| CameraError::CaptureFailed(format!("Failed to stop stream: {}", e)))?;
        self.streaming = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn capture_frame(&mut self) -> Result<CameraFrame, CameraError> {
        let buffer = self
            .camera()?
            .poll_frame()
            .map_err(|e| CameraError::CaptureFailed(format!("Failed to capture frame: {}", e)))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| CameraError::CaptureFailed(format!("Failed to decode frame: {}", e)))?;

        let (width, height) = image.dimensions();
        Ok(CameraFrame::new(image.into_raw(), width, height, self.device_id.clone())
            .with_pixel_format(PixelFormat::Rgb24))
    }

    fn apply_controls(&mut self, controls: &DeviceControls) -> Result<(), CameraError> {
        // nokhwa exposes no portable flash/zoom control; modes are tracked by
        // the core and only logged here.
        log::debug!("Camera {} controls: {:?}", self.device_id, controls);
        Ok(())
    }
}

impl Drop for NokhwaStream {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

// CallbackCamera is guarded by a mutex and only touched through it.
unsafe impl Send for NokhwaStream {}
