//! In-memory capture backend with deterministic frames and fault injection.
//!
//! Used by the test suite, the benches and the CLI `--synthetic` mode. Faults
//! and counters are shared atomics so a test can flip a fault while a camera is
//! running and observe exactly what the core asked of the "hardware".

use super::{CaptureBackend, DeviceStream, PhotoCompletion};
use crate::errors::CameraError;
use crate::properties::DeviceControls;
use crate::testing::synthetic_data::{back_camera, front_camera, microphone, synthetic_video_frame};
use crate::types::{CameraDeviceInfo, CameraFrame, MediaType, ResolvedFormat};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct SyntheticFaults {
    /// Enumeration is refused as if the OS denied hardware access.
    pub deny_enumeration: AtomicBool,
    pub fail_open: AtomicBool,
    pub fail_photo: AtomicBool,
    /// Every photo completion is delivered twice.
    pub duplicate_photo_callbacks: AtomicBool,
    /// Report an interruption after this many frames since start (0 = never).
    pub interrupt_after_frames: AtomicU64,
    /// Delay before a photo completion fires.
    pub photo_delay_ms: AtomicU64,
    /// Deliver frames as fast as they are pulled instead of at the format rate.
    pub unpaced: AtomicBool,
}

#[derive(Debug, Default)]
pub struct SyntheticCounters {
    pub enumerations: AtomicUsize,
    pub opens: AtomicUsize,
    pub stream_starts: AtomicUsize,
    pub stream_stops: AtomicUsize,
    pub frames: AtomicUsize,
    pub photos: AtomicUsize,
    pub control_updates: AtomicUsize,
    /// Hardware indicator (camera LED).
    pub indicator_on: AtomicBool,
}

impl SyntheticCounters {
    /// Whether any call reached the hardware beyond enumeration.
    pub fn hardware_touched(&self) -> bool {
        self.opens.load(Ordering::SeqCst) > 0 || self.stream_starts.load(Ordering::SeqCst) > 0
    }
}

pub struct SyntheticBackend {
    devices: Mutex<Vec<CameraDeviceInfo>>,
    faults: Arc<SyntheticFaults>,
    counters: Arc<SyntheticCounters>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<CameraDeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            faults: Arc::new(SyntheticFaults::default()),
            counters: Arc::new(SyntheticCounters::default()),
        }
    }

    /// Back camera, front camera and a microphone.
    pub fn with_default_devices() -> Self {
        Self::new(vec![front_camera(), back_camera(), microphone()])
    }

    pub fn faults(&self) -> &Arc<SyntheticFaults> {
        &self.faults
    }

    pub fn counters(&self) -> &Arc<SyntheticCounters> {
        &self.counters
    }

    pub fn add_device(&self, device: CameraDeviceInfo) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.retain(|d| d.id != device.id);
            devices.push(device);
        }
    }

    pub fn remove_device(&self, device_id: &str) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.retain(|d| d.id != device_id);
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn list_devices(&self, media_type: MediaType) -> Result<Vec<CameraDeviceInfo>, CameraError> {
        self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.faults.deny_enumeration.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceUnavailable(
                "hardware enumeration denied".to_string(),
            ));
        }

        let devices = self.devices.lock().map_err(|_| CameraError::poisoned_lock())?;
        Ok(devices
            .iter()
            .filter(|d| d.media_type == media_type)
            .cloned()
            .collect())
    }

    fn open_device(
        &self,
        device: &CameraDeviceInfo,
        format: &ResolvedFormat,
    ) -> Result<Box<dyn DeviceStream>, CameraError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_open.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceUnavailable(format!(
                "device {} is busy",
                device.id
            )));
        }

        let present = self
            .devices
            .lock()
            .map_err(|_| CameraError::poisoned_lock())?
            .iter()
            .any(|d| d.id == device.id);
        if !present {
            return Err(CameraError::DeviceUnavailable(format!(
                "device {} disconnected",
                device.id
            )));
        }

        log::debug!("Synthetic device {} opened at {}", device.id, format.format);
        Ok(Box::new(SyntheticStream {
            device_id: device.id.clone(),
            format: format.clone(),
            streaming: false,
            frame_number: 0,
            frames_since_start: 0,
            controls: DeviceControls::default(),
            faults: self.faults.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct SyntheticStream {
    device_id: String,
    format: ResolvedFormat,
    streaming: bool,
    frame_number: u64,
    frames_since_start: u64,
    controls: DeviceControls,
    faults: Arc<SyntheticFaults>,
    counters: Arc<SyntheticCounters>,
}

impl SyntheticStream {
    fn frame_interval(&self) -> Duration {
        let fps = if self.format.fps > 0.0 { self.format.fps } else { 30.0 };
        Duration::from_secs_f64(1.0 / fps)
    }
}

impl DeviceStream for SyntheticStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn start_stream(&mut self) -> Result<(), CameraError> {
        if !self.streaming {
            self.streaming = true;
            self.frames_since_start = 0;
            self.counters.stream_starts.fetch_add(1, Ordering::SeqCst);
            self.counters.indicator_on.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CameraError> {
        if self.streaming {
            self.streaming = false;
            self.counters.stream_stops.fetch_add(1, Ordering::SeqCst);
            self.counters.indicator_on.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn capture_frame(&mut self) -> Result<CameraFrame, CameraError> {
        if !self.streaming {
            return Err(CameraError::CaptureFailed("stream not started".to_string()));
        }

        let interrupt_after = self.faults.interrupt_after_frames.load(Ordering::SeqCst);
        if interrupt_after > 0 && self.frames_since_start >= interrupt_after {
            return Err(CameraError::SessionInterrupted(format!(
                "device {} taken by another client",
                self.device_id
            )));
        }

        if !self.faults.unpaced.load(Ordering::Relaxed) {
            std::thread::sleep(self.frame_interval());
        }

        let resolution = self.format.format.resolution;
        let mut frame = synthetic_video_frame(self.frame_number, resolution.width, resolution.height);
        frame.device_id = self.device_id.clone();
        self.frame_number = self.frame_number.wrapping_add(1);
        self.frames_since_start += 1;
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    fn apply_controls(&mut self, controls: &DeviceControls) -> Result<(), CameraError> {
        self.controls = *controls;
        self.counters.control_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture_photo(&mut self, completion: PhotoCompletion) {
        self.counters.photos.fetch_add(1, Ordering::SeqCst);

        let result = if self.faults.fail_photo.load(Ordering::SeqCst) {
            Err(CameraError::CaptureFailed("sensor readout failed".to_string()))
        } else {
            self.capture_frame()
        };
        let delay = Duration::from_millis(self.faults.photo_delay_ms.load(Ordering::SeqCst));
        let deliveries = if self.faults.duplicate_photo_callbacks.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        // Completion arrives on a device thread, never on the caller's.
        let spawned = std::thread::Builder::new()
            .name("camcore-synthetic-photo".to_string())
            .spawn({
                let completion = completion.clone();
                let result = result.clone();
                move || {
                    std::thread::sleep(delay);
                    for _ in 0..deliveries {
                        completion(result.clone());
                    }
                }
            });

        if let Err(e) = spawned {
            log::warn!("Synthetic photo thread failed to spawn: {}", e);
            completion(Err(CameraError::CaptureFailed(format!("spawn failed: {e}"))));
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}
