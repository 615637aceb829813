use thiserror::Error;

/// Errors produced by the camera core.
///
/// Configuration-time failures are returned directly to the caller; runtime
/// failures (capture, interruption) travel through the event channel or the
/// pending photo request, which is why the type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Configuration not supported: {0}")]
    ConfigurationNotSupported(String),
    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
    #[error("Session interrupted: {0}")]
    SessionInterrupted(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CameraError {
    /// Stable error code used on the host message boundary.
    pub fn code(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied(_) => "permissionDenied",
            CameraError::DeviceUnavailable(_) => "deviceUnavailable",
            CameraError::ConfigurationNotSupported(_) => "configurationNotSupported",
            CameraError::InvalidSessionState(_) => "invalidSessionState",
            CameraError::CaptureFailed(_) => "captureFailed",
            CameraError::SessionInterrupted(_) => "sessionInterrupted",
            CameraError::Io(_) => "io",
            CameraError::Config(_) => "config",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CameraError::PermissionDenied(msg)
            | CameraError::DeviceUnavailable(msg)
            | CameraError::ConfigurationNotSupported(msg)
            | CameraError::InvalidSessionState(msg)
            | CameraError::CaptureFailed(msg)
            | CameraError::SessionInterrupted(msg)
            | CameraError::Io(msg)
            | CameraError::Config(msg) => msg,
        }
    }

    pub(crate) fn poisoned_lock() -> Self {
        CameraError::InvalidSessionState("lock poisoned by previous panic".to_string())
    }
}

impl From<std::io::Error> for CameraError {
    fn from(e: std::io::Error) -> Self {
        CameraError::Io(e.to_string())
    }
}

pub type CameraResult<T> = Result<T, CameraError>;
