//! Host message API.
//!
//! A host (UI shell, IPC bridge, CLI) drives cameras through typed
//! [`HostRequest`] messages and gets a [`HostResponse`] or a [`HostError`]
//! carrying a stable error code. Open cameras live in an id arena; ids are
//! never reused.

use crate::camera::{Camera, CameraEnvironment};
use crate::errors::CameraError;
use crate::media_settings::MediaSettings;
use crate::permissions::PermissionStatus;
use crate::properties::{
    DeviceOrientation, ExposureMode, FlashMode, FocusMode, VideoStabilization,
};
use crate::recording::RecordingStats;
use crate::stream::EventChannel;
use crate::types::{CameraDeviceInfo, CameraFormat, MediaType, ResolvedFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u64);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_media_type() -> MediaType {
    MediaType::Video
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostRequest {
    ListDevices {
        #[serde(default = "default_media_type")]
        media_type: MediaType,
    },
    ListFormats {
        device_id: String,
    },
    PermissionStatus {
        #[serde(default = "default_media_type")]
        media_type: MediaType,
    },
    RequestPermission {
        #[serde(default = "default_media_type")]
        media_type: MediaType,
    },
    /// Settings default to the configured ones when omitted.
    Open {
        device_id: String,
        #[serde(default)]
        settings: Option<MediaSettings>,
    },
    StartPreview {
        camera_id: CameraId,
    },
    StopPreview {
        camera_id: CameraId,
    },
    PausePreview {
        camera_id: CameraId,
    },
    ResumePreview {
        camera_id: CameraId,
    },
    TakePicture {
        camera_id: CameraId,
    },
    StartVideoRecording {
        camera_id: CameraId,
    },
    StopVideoRecording {
        camera_id: CameraId,
    },
    PauseVideoRecording {
        camera_id: CameraId,
    },
    ResumeVideoRecording {
        camera_id: CameraId,
    },
    SetVideoStabilization {
        camera_id: CameraId,
        mode: VideoStabilization,
    },
    SetOrientation {
        camera_id: CameraId,
        orientation: DeviceOrientation,
    },
    UnlockOrientation {
        camera_id: CameraId,
    },
    SetFlashMode {
        camera_id: CameraId,
        mode: FlashMode,
    },
    SetFocusMode {
        camera_id: CameraId,
        mode: FocusMode,
    },
    SetExposureMode {
        camera_id: CameraId,
        mode: ExposureMode,
    },
    SetZoomLevel {
        camera_id: CameraId,
        zoom: f32,
    },
    Close {
        camera_id: CameraId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostResponse {
    Devices {
        devices: Vec<CameraDeviceInfo>,
    },
    Formats {
        formats: Vec<CameraFormat>,
    },
    Permission {
        status: PermissionStatus,
    },
    Opened {
        camera_id: CameraId,
        device: CameraDeviceInfo,
        format: ResolvedFormat,
        min_zoom: f32,
        max_zoom: f32,
    },
    PhotoSaved {
        path: PathBuf,
    },
    RecordingStarted {
        path: PathBuf,
    },
    RecordingStopped {
        stats: RecordingStats,
    },
    Done,
}

/// Error returned across the host boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct HostError {
    pub code: String,
    pub message: String,
}

impl From<CameraError> for HostError {
    fn from(e: CameraError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.message().to_string(),
        }
    }
}

pub struct CameraHost {
    env: CameraEnvironment,
    cameras: RwLock<HashMap<CameraId, Arc<Camera>>>,
    next_id: AtomicU64,
}

impl CameraHost {
    pub fn new(env: CameraEnvironment) -> Self {
        Self {
            env,
            cameras: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn environment(&self) -> &CameraEnvironment {
        &self.env
    }

    pub async fn camera(&self, id: CameraId) -> Result<Arc<Camera>, CameraError> {
        self.cameras
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CameraError::InvalidSessionState(format!("no open camera with id {id}")))
    }

    /// Event stream of an open camera.
    pub async fn events(&self, id: CameraId) -> Result<EventChannel, HostError> {
        Ok(self.camera(id).await?.events())
    }

    pub async fn open_cameras(&self) -> Vec<CameraId> {
        let mut ids: Vec<_> = self.cameras.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn handle(&self, request: HostRequest) -> Result<HostResponse, HostError> {
        log::debug!("Host request: {:?}", request);
        let response = self.dispatch(request).await;
        if let Err(e) = &response {
            log::debug!("Host request failed: {}", e);
        }
        response.map_err(HostError::from)
    }

    /// JSON in, JSON out: `{"ok": <response>}` or `{"error": {code, message}}`.
    pub async fn handle_json(&self, request: &str) -> serde_json::Value {
        let request: HostRequest = match serde_json::from_str(request) {
            Ok(request) => request,
            Err(e) => {
                let error = HostError {
                    code: "invalidRequest".to_string(),
                    message: e.to_string(),
                };
                return serde_json::json!({ "error": error });
            }
        };
        match self.handle(request).await {
            Ok(response) => serde_json::json!({ "ok": response }),
            Err(error) => serde_json::json!({ "error": error }),
        }
    }

    async fn dispatch(&self, request: HostRequest) -> Result<HostResponse, CameraError> {
        match request {
            HostRequest::ListDevices { media_type } => {
                let discovery = self.env.discovery();
                let devices =
                    tokio::task::spawn_blocking(move || discovery.list_devices(media_type))
                        .await
                        .map_err(|e| {
                            CameraError::DeviceUnavailable(format!("enumeration task failed: {e}"))
                        })??;
                Ok(HostResponse::Devices { devices })
            }
            HostRequest::ListFormats { device_id } => {
                let discovery = self.env.discovery();
                let formats = tokio::task::spawn_blocking(move || discovery.formats(&device_id))
                    .await
                    .map_err(|e| {
                        CameraError::DeviceUnavailable(format!("enumeration task failed: {e}"))
                    })??;
                Ok(HostResponse::Formats { formats })
            }
            HostRequest::PermissionStatus { media_type } => Ok(HostResponse::Permission {
                status: self.env.permissions.authorization_status(media_type),
            }),
            HostRequest::RequestPermission { media_type } => {
                let status = match self.env.permissions.authorization_status(media_type) {
                    PermissionStatus::NotDetermined => {
                        self.env.permissions.request_access(media_type).await
                    }
                    decided => decided,
                };
                Ok(HostResponse::Permission { status })
            }
            HostRequest::Open {
                device_id,
                settings,
            } => {
                let settings = settings.unwrap_or_else(|| self.env.config.media_settings());
                let camera = Camera::open(&device_id, settings, self.env.clone()).await?;
                let id = CameraId(self.next_id.fetch_add(1, Ordering::SeqCst));
                let response = HostResponse::Opened {
                    camera_id: id,
                    device: camera.device().clone(),
                    format: camera.format().clone(),
                    min_zoom: camera.min_zoom(),
                    max_zoom: camera.max_zoom(),
                };
                self.cameras.write().await.insert(id, Arc::new(camera));
                log::info!("Camera {} registered as {}", device_id, id);
                Ok(response)
            }
            HostRequest::StartPreview { camera_id } => {
                self.camera(camera_id).await?.start_preview().await?;
                Ok(HostResponse::Done)
            }
            HostRequest::StopPreview { camera_id } => {
                self.camera(camera_id).await?.stop_preview().await?;
                Ok(HostResponse::Done)
            }
            HostRequest::PausePreview { camera_id } => {
                self.camera(camera_id).await?.pause_preview()?;
                Ok(HostResponse::Done)
            }
            HostRequest::ResumePreview { camera_id } => {
                self.camera(camera_id).await?.resume_preview()?;
                Ok(HostResponse::Done)
            }
            HostRequest::TakePicture { camera_id } => {
                let path = self.camera(camera_id).await?.take_picture().await?;
                Ok(HostResponse::PhotoSaved { path })
            }
            HostRequest::StartVideoRecording { camera_id } => {
                let path = self.camera(camera_id).await?.start_video_recording().await?;
                Ok(HostResponse::RecordingStarted { path })
            }
            HostRequest::StopVideoRecording { camera_id } => {
                let stats = self.camera(camera_id).await?.stop_video_recording().await?;
                Ok(HostResponse::RecordingStopped { stats })
            }
            HostRequest::PauseVideoRecording { camera_id } => {
                self.camera(camera_id).await?.pause_video_recording()?;
                Ok(HostResponse::Done)
            }
            HostRequest::ResumeVideoRecording { camera_id } => {
                self.camera(camera_id).await?.resume_video_recording()?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetVideoStabilization { camera_id, mode } => {
                self.camera(camera_id)
                    .await?
                    .set_video_stabilization(mode)
                    .await?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetOrientation {
                camera_id,
                orientation,
            } => {
                self.camera(camera_id)
                    .await?
                    .set_orientation(orientation)
                    .await?;
                Ok(HostResponse::Done)
            }
            HostRequest::UnlockOrientation { camera_id } => {
                self.camera(camera_id).await?.unlock_orientation().await?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetFlashMode { camera_id, mode } => {
                self.camera(camera_id).await?.set_flash_mode(mode).await?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetFocusMode { camera_id, mode } => {
                self.camera(camera_id).await?.set_focus_mode(mode).await?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetExposureMode { camera_id, mode } => {
                self.camera(camera_id).await?.set_exposure_mode(mode).await?;
                Ok(HostResponse::Done)
            }
            HostRequest::SetZoomLevel { camera_id, zoom } => {
                self.camera(camera_id).await?.set_zoom_level(zoom).await?;
                Ok(HostResponse::Done)
            }
            HostRequest::Close { camera_id } => {
                let camera = self.cameras.write().await.remove(&camera_id);
                let camera = camera.ok_or_else(|| {
                    CameraError::InvalidSessionState(format!("no open camera with id {camera_id}"))
                })?;
                camera.close().await?;
                log::info!("Camera {} released", camera_id);
                Ok(HostResponse::Done)
            }
        }
    }

    /// Close every open camera.
    pub async fn close_all(&self) {
        let cameras: Vec<_> = self.cameras.write().await.drain().collect();
        for (id, camera) in cameras {
            if let Err(e) = camera.close().await {
                log::warn!("Closing camera {} failed: {}", id, e);
            }
        }
    }
}
