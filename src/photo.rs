//! Still photo requests and their exactly-once resolution.
//!
//! Each capture gets a correlation id and a oneshot held by the
//! [`PhotoRequestRegistry`]. The device reports back through a
//! [`SavePhotoDelegate`], which writes the file off the session thread and
//! resolves the request once. Repeated device callbacks are ignored.

use crate::errors::CameraError;
use crate::platform::PhotoCompletion;
use crate::properties::ImageFileFormat;
use crate::types::{CameraFrame, PixelFormat};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

pub type PhotoResult = Result<PathBuf, CameraError>;

/// Pending photo requests keyed by correlation id.
#[derive(Default)]
pub struct PhotoRequestRegistry {
    inner: Mutex<RegistryInner>,
    idle: Notify,
}

#[derive(Default)]
struct RegistryInner {
    pending: HashMap<Uuid, oneshot::Sender<PhotoResult>>,
    closed: bool,
}

impl PhotoRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Result<PhotoCaptureRequest, CameraError> {
        let mut inner = self.inner.lock().map_err(|_| CameraError::poisoned_lock())?;
        if inner.closed {
            return Err(CameraError::InvalidSessionState(
                "camera is closed".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        inner.pending.insert(id, sender);
        Ok(PhotoCaptureRequest { id, receiver })
    }

    /// Resolve `id` with `result`. Returns false when the request was already
    /// resolved or never existed.
    pub fn resolve(&self, id: Uuid, result: PhotoResult) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(sender) = inner.pending.remove(&id) else {
            return false;
        };
        let now_idle = inner.pending.is_empty();
        drop(inner);

        if sender.send(result).is_err() {
            log::debug!("Photo request {} resolved after its caller went away", id);
        }
        if now_idle {
            self.idle.notify_waiters();
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .map(|i| i.pending.contains_key(&id))
            .unwrap_or(false)
    }

    /// Wait until no request is pending. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.pending_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Fail every pending request with `error`; returns how many were failed.
    pub fn fail_all(&self, error: CameraError) -> usize {
        let drained: Vec<_> = match self.inner.lock() {
            Ok(mut inner) => inner.pending.drain().collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for (id, sender) in drained {
            log::warn!("Photo request {} failed: {}", id, error);
            let _ = sender.send(Err(error.clone()));
        }
        if count > 0 {
            self.idle.notify_waiters();
        }
        count
    }

    /// Refuse new requests. Pending ones are left for the caller to settle.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|i| i.closed).unwrap_or(true)
    }
}

/// Handle to one in-flight photo.
#[derive(Debug)]
pub struct PhotoCaptureRequest {
    id: Uuid,
    receiver: oneshot::Receiver<PhotoResult>,
}

impl PhotoCaptureRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the saved file path.
    pub async fn wait(self) -> PhotoResult {
        let id = self.id;
        self.receiver.await.unwrap_or_else(|_| {
            Err(CameraError::CaptureFailed(format!(
                "photo request {id} abandoned"
            )))
        })
    }
}

/// Where and how a captured frame is written.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoTarget {
    pub path: PathBuf,
    pub format: ImageFileFormat,
    pub jpeg_quality: u8,
    /// Clockwise rotation applied to the pixels.
    pub rotation_degrees: u16,
    pub mirrored: bool,
}

pub trait PhotoWriter: Send + Sync {
    fn write(&self, frame: &CameraFrame, target: &PhotoTarget) -> Result<PathBuf, CameraError>;
}

/// Encodes frames with the `image` crate and writes them to disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilePhotoWriter;

impl FilePhotoWriter {
    pub fn new() -> Self {
        Self
    }
}

impl PhotoWriter for FilePhotoWriter {
    fn write(&self, frame: &CameraFrame, target: &PhotoTarget) -> Result<PathBuf, CameraError> {
        let img = orient(frame_to_rgb(frame)?, target.rotation_degrees, target.mirrored);

        if let Some(parent) = target.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match target.format {
            ImageFileFormat::Jpeg => {
                let file = File::create(&target.path)?;
                let mut writer = BufWriter::new(file);
                JpegEncoder::new_with_quality(&mut writer, target.jpeg_quality)
                    .encode_image(&img)
                    .map_err(|e| CameraError::CaptureFailed(format!("JPEG encoding failed: {e}")))?;
                writer.flush()?;
            }
            ImageFileFormat::Png => {
                img.save_with_format(&target.path, image::ImageFormat::Png)
                    .map_err(|e| CameraError::CaptureFailed(format!("PNG encoding failed: {e}")))?;
            }
        }

        log::info!(
            "Photo saved to {} ({}x{})",
            target.path.display(),
            img.width(),
            img.height()
        );
        Ok(target.path.clone())
    }
}

fn frame_to_rgb(frame: &CameraFrame) -> Result<RgbImage, CameraError> {
    let invalid = || {
        CameraError::CaptureFailed(format!(
            "frame {} has {} bytes for {}x{} {}",
            frame.sequence,
            frame.data.len(),
            frame.width,
            frame.height,
            frame.pixel_format
        ))
    };

    match frame.pixel_format {
        PixelFormat::Rgb24 => {
            RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec()).ok_or_else(invalid)
        }
        PixelFormat::Bgra32 => {
            let expected = frame.width as usize * frame.height as usize * 4;
            if frame.data.len() < expected {
                return Err(invalid());
            }
            let rgb = frame.data[..expected]
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect();
            RgbImage::from_raw(frame.width, frame.height, rgb).ok_or_else(invalid)
        }
        other => Err(CameraError::CaptureFailed(format!(
            "cannot encode {other} frames"
        ))),
    }
}

fn orient(img: RgbImage, rotation_degrees: u16, mirrored: bool) -> RgbImage {
    let img = if mirrored {
        imageops::flip_horizontal(&img)
    } else {
        img
    };
    match rotation_degrees % 360 {
        90 => imageops::rotate90(&img),
        180 => imageops::rotate180(&img),
        270 => imageops::rotate270(&img),
        _ => img,
    }
}

/// `<dir>[/<YYYY-MM-DD>]/IMG_<YYYYMMDD_HHMMSS_mmm>_<id prefix>.<ext>`
pub fn photo_path(
    output_directory: &Path,
    date_subdirectories: bool,
    format: ImageFileFormat,
    id: Uuid,
    now: DateTime<Local>,
) -> PathBuf {
    let mut dir = output_directory.to_path_buf();
    if date_subdirectories {
        dir.push(now.format("%Y-%m-%d").to_string());
    }
    let short_id: String = id.simple().to_string().chars().take(8).collect();
    dir.join(format!(
        "IMG_{}_{}.{}",
        now.format("%Y%m%d_%H%M%S_%3f"),
        short_id,
        format.extension()
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateState {
    Pending,
    /// Frame received, file being written.
    Processing,
    Completed,
    Failed,
}

/// Receives the device callback for one photo request.
pub struct SavePhotoDelegate {
    id: Uuid,
    state: Mutex<DelegateState>,
    registry: Weak<PhotoRequestRegistry>,
    writer: Arc<dyn PhotoWriter>,
    target: PhotoTarget,
    runtime: Handle,
}

impl SavePhotoDelegate {
    pub fn new(
        id: Uuid,
        registry: &Arc<PhotoRequestRegistry>,
        writer: Arc<dyn PhotoWriter>,
        target: PhotoTarget,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(DelegateState::Pending),
            registry: Arc::downgrade(registry),
            writer,
            target,
            runtime,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DelegateState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(DelegateState::Failed)
    }

    /// Device-facing callback. Safe to invoke any number of times from any
    /// thread.
    pub fn completion(self: &Arc<Self>) -> PhotoCompletion {
        let delegate = self.clone();
        Arc::new(move |result| delegate.on_capture(result))
    }

    pub fn on_capture(self: &Arc<Self>, result: Result<CameraFrame, CameraError>) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state != DelegateState::Pending {
                log::debug!("Duplicate photo callback for {} ignored", self.id);
                return;
            }
            *state = DelegateState::Processing;
        }

        match self.registry.upgrade() {
            Some(registry) if registry.is_pending(self.id) => {}
            _ => {
                log::debug!("Photo callback for {} arrived after its request ended", self.id);
                self.finish(DelegateState::Failed);
                return;
            }
        }

        match result {
            Ok(frame) => {
                let delegate = self.clone();
                self.runtime.spawn_blocking(move || {
                    let written = delegate.writer.write(&frame, &delegate.target);
                    delegate.settle(written);
                });
            }
            Err(e) => self.settle(Err(e)),
        }
    }

    fn settle(&self, result: PhotoResult) {
        let result = result.map_err(|e| match e {
            CameraError::CaptureFailed(_) => e,
            other => CameraError::CaptureFailed(other.to_string()),
        });
        let state = if result.is_ok() {
            DelegateState::Completed
        } else {
            DelegateState::Failed
        };
        if let Err(e) = &result {
            log::warn!("Photo {} failed: {}", self.id, e);
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.resolve(self.id, result);
        }
        self.finish(state);
    }

    fn finish(&self, state: DelegateState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}
