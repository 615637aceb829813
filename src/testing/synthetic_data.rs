//! Deterministic frame and device data for hardware-free runs.

use crate::properties::ResolutionPreset;
use crate::types::{
    CameraDeviceInfo, CameraFormat, CameraFrame, DevicePosition, FrameRateRange, MediaType,
    PixelFormat,
};

/// Create an RGB24 gradient frame whose content shifts with `frame_number`,
/// so consecutive frames differ and orientation transforms are observable.
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> CameraFrame {
    let mut data = vec![0u8; (width as usize) * (height as usize) * 3];

    let base = (frame_number % 256) as u8;
    for (idx, pixel) in data.chunks_exact_mut(3).enumerate() {
        let x = (idx as u32 % width.max(1)) as u8;
        let y = (idx as u32 / width.max(1)) as u8;
        pixel[0] = base.wrapping_add(x);
        pixel[1] = base.wrapping_add(y);
        pixel[2] = base.wrapping_add(x.wrapping_add(y));
    }

    CameraFrame::new(data, width, height, "synthetic").with_pixel_format(PixelFormat::Rgb24)
}

/// Format list for a device capable of every preset up to `max`.
pub fn formats_up_to(max: ResolutionPreset, fps: f64) -> Vec<CameraFormat> {
    let ladder = [
        ResolutionPreset::Low,
        ResolutionPreset::Medium,
        ResolutionPreset::High,
        ResolutionPreset::VeryHigh,
        ResolutionPreset::UltraHigh,
    ];
    let cap = max.resolution().map(|r| r.area()).unwrap_or(u64::MAX);

    ladder
        .iter()
        .filter_map(|p| p.resolution())
        .filter(|r| r.area() <= cap)
        .map(|r| {
            CameraFormat::new(r.width, r.height, fps)
                .with_frame_rate_ranges(vec![FrameRateRange::new(1.0, fps)])
        })
        .collect()
}

/// A rear camera with flash, torch and 1x-8x zoom, capable of 1080p30.
pub fn back_camera() -> CameraDeviceInfo {
    CameraDeviceInfo::new("synthetic-back", "Synthetic Back Camera")
        .with_position(DevicePosition::Back)
        .with_formats(formats_up_to(ResolutionPreset::VeryHigh, 30.0))
        .with_flash(true, true)
        .with_zoom_range(1.0, 8.0)
}

/// A front camera limited to 720p30 without flash.
pub fn front_camera() -> CameraDeviceInfo {
    CameraDeviceInfo::new("synthetic-front", "Synthetic Front Camera")
        .with_position(DevicePosition::Front)
        .with_formats(formats_up_to(ResolutionPreset::High, 30.0))
        .with_zoom_range(1.0, 2.0)
}

/// A built-in microphone.
pub fn microphone() -> CameraDeviceInfo {
    CameraDeviceInfo::new("synthetic-mic", "Synthetic Microphone").with_media_type(MediaType::Audio)
}
