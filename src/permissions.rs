//! Camera and microphone authorization.
//!
//! [`PermissionService`] is the seam to the OS authorization service;
//! [`PermissionManager`] turns its callback-based request into an awaitable
//! answer and gates session start on it.

use crate::errors::CameraError;
use crate::types::MediaType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Permission status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    /// User hasn't been asked yet
    NotDetermined,
    /// Permission denied
    Denied,
    /// Permission restricted (parental controls, device policy)
    Restricted,
    /// Permission granted
    Authorized,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionStatus::NotDetermined => write!(f, "not_determined"),
            PermissionStatus::Denied => write!(f, "denied"),
            PermissionStatus::Restricted => write!(f, "restricted"),
            PermissionStatus::Authorized => write!(f, "authorized"),
        }
    }
}

/// Detailed permission information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionInfo {
    pub status: PermissionStatus,
    pub message: String,
    pub can_request: bool,
}

/// Completion of an access request; `true` when access was granted.
pub type AccessCompletion = Box<dyn FnOnce(bool) + Send>;

pub trait PermissionService: Send + Sync {
    fn authorization_status(&self, media_type: MediaType) -> PermissionStatus;

    /// Ask the OS for access. The completion fires once the user answered or
    /// immediately when the OS decides without asking.
    fn request_access(&self, media_type: MediaType, completion: AccessCompletion);
}

#[derive(Clone)]
pub struct PermissionManager {
    service: Arc<dyn PermissionService>,
}

impl PermissionManager {
    pub fn new(service: Arc<dyn PermissionService>) -> Self {
        Self { service }
    }

    pub fn authorization_status(&self, media_type: MediaType) -> PermissionStatus {
        self.service.authorization_status(media_type)
    }

    /// Request access and wait for the answer: `Authorized` or `Denied`.
    pub async fn request_access(&self, media_type: MediaType) -> PermissionStatus {
        log::info!("Requesting {} permission", media_type);

        let (tx, rx) = oneshot::channel();
        self.service.request_access(
            media_type,
            Box::new(move |granted| {
                let _ = tx.send(granted);
            }),
        );

        match rx.await {
            Ok(true) => {
                log::info!("{} permission granted", media_type);
                PermissionStatus::Authorized
            }
            Ok(false) => {
                log::warn!("{} permission denied", media_type);
                PermissionStatus::Denied
            }
            Err(_) => {
                log::warn!("{} permission request dropped without an answer", media_type);
                PermissionStatus::Denied
            }
        }
    }

    /// Pass when authorized, ask when undetermined, fail otherwise.
    pub async fn ensure_authorized(&self, media_type: MediaType) -> Result<(), CameraError> {
        match self.authorization_status(media_type) {
            PermissionStatus::Authorized => Ok(()),
            PermissionStatus::NotDetermined => match self.request_access(media_type).await {
                PermissionStatus::Authorized => Ok(()),
                status => Err(CameraError::PermissionDenied(format!(
                    "{media_type} access {status}"
                ))),
            },
            status @ (PermissionStatus::Denied | PermissionStatus::Restricted) => {
                Err(CameraError::PermissionDenied(format!(
                    "{media_type} access {status}"
                )))
            }
        }
    }
}

/// Permission service backed by what the host OS exposes without a prompt.
#[derive(Debug, Default)]
pub struct SystemPermissions;

impl SystemPermissions {
    pub fn new() -> Self {
        Self
    }

    pub fn detailed(&self, media_type: MediaType) -> PermissionInfo {
        #[cfg(target_os = "linux")]
        {
            match media_type {
                MediaType::Video => check_video_permission_linux(),
                MediaType::Audio => check_audio_permission_linux(),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            PermissionInfo {
                status: PermissionStatus::Authorized,
                message: format!("{media_type} access is mediated by the OS on first use"),
                can_request: false,
            }
        }
    }
}

impl PermissionService for SystemPermissions {
    fn authorization_status(&self, media_type: MediaType) -> PermissionStatus {
        self.detailed(media_type).status
    }

    fn request_access(&self, media_type: MediaType, completion: AccessCompletion) {
        // No programmatic prompt exists here; the OS answers immediately.
        let info = self.detailed(media_type);
        if info.status != PermissionStatus::Authorized {
            log::warn!("Cannot request permission: {}", info.message);
        }
        completion(info.status == PermissionStatus::Authorized);
    }
}

#[cfg(target_os = "linux")]
fn check_video_permission_linux() -> PermissionInfo {
    use std::path::Path;

    let video_devices: Vec<_> = (0..10)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .collect();

    let Some(first_device) = video_devices.first() else {
        return PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: "No video devices found at /dev/video*".to_string(),
            can_request: false,
        };
    };

    match std::fs::metadata(first_device) {
        Ok(_) if linux_groups_contain(&["video", "plugdev"]) => PermissionInfo {
            status: PermissionStatus::Authorized,
            message: format!(
                "Camera access granted (user in video group, {} found)",
                first_device
            ),
            can_request: false,
        },
        Ok(_) => PermissionInfo {
            status: PermissionStatus::Denied,
            message: format!(
                "Camera device {} exists but user not in video group - run: sudo usermod -a -G video $USER",
                first_device
            ),
            can_request: false,
        },
        Err(e) => PermissionInfo {
            status: PermissionStatus::Denied,
            message: format!("Cannot access {}: {}", first_device, e),
            can_request: false,
        },
    }
}

#[cfg(target_os = "linux")]
fn check_audio_permission_linux() -> PermissionInfo {
    if std::path::Path::new("/dev/snd").exists() {
        PermissionInfo {
            status: PermissionStatus::Authorized,
            message: "Sound devices present at /dev/snd".to_string(),
            can_request: false,
        }
    } else {
        PermissionInfo {
            status: PermissionStatus::NotDetermined,
            message: "No sound devices found at /dev/snd".to_string(),
            can_request: false,
        }
    }
}

#[cfg(target_os = "linux")]
fn linux_groups_contain(wanted: &[&str]) -> bool {
    std::process::Command::new("groups")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|groups| {
            groups
                .split_whitespace()
                .any(|g| wanted.contains(&g))
        })
        .unwrap_or(false)
}

/// Scripted permission service.
///
/// Statuses are set per media type; a request on an undetermined type answers
/// with the configured response from a separate thread and records the new
/// status, like an OS dialog would.
#[derive(Debug, Default)]
pub struct FixedPermissions {
    statuses: Mutex<HashMap<MediaType, PermissionStatus>>,
    responses: Mutex<HashMap<MediaType, bool>>,
    requests: AtomicUsize,
    never_respond: AtomicBool,
}

impl FixedPermissions {
    /// Everything authorized.
    pub fn authorized() -> Self {
        let perms = Self::default();
        perms.set_status(MediaType::Video, PermissionStatus::Authorized);
        perms.set_status(MediaType::Audio, PermissionStatus::Authorized);
        perms
    }

    pub fn with_status(media_type: MediaType, status: PermissionStatus) -> Self {
        let perms = Self::authorized();
        perms.set_status(media_type, status);
        perms
    }

    pub fn set_status(&self, media_type: MediaType, status: PermissionStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(media_type, status);
        }
    }

    /// Answer given by the "user" when asked.
    pub fn set_response(&self, media_type: MediaType, granted: bool) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(media_type, granted);
        }
    }

    /// Drop completions without answering.
    pub fn set_never_respond(&self, never: bool) {
        self.never_respond.store(never, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionService for FixedPermissions {
    fn authorization_status(&self, media_type: MediaType) -> PermissionStatus {
        self.statuses
            .lock()
            .ok()
            .and_then(|s| s.get(&media_type).copied())
            .unwrap_or(PermissionStatus::NotDetermined)
    }

    fn request_access(&self, media_type: MediaType, completion: AccessCompletion) {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.never_respond.load(Ordering::SeqCst) {
            drop(completion);
            return;
        }

        let status = self.authorization_status(media_type);
        if status != PermissionStatus::NotDetermined {
            completion(status == PermissionStatus::Authorized);
            return;
        }

        let granted = self
            .responses
            .lock()
            .ok()
            .and_then(|r| r.get(&media_type).copied())
            .unwrap_or(false);
        self.set_status(
            media_type,
            if granted {
                PermissionStatus::Authorized
            } else {
                PermissionStatus::Denied
            },
        );

        std::thread::spawn(move || completion(granted));
    }
}
