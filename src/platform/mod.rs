//! Hardware seam: capture backends and the device streams they open.
//!
//! The session graph never talks to hardware directly. It asks a
//! [`CaptureBackend`] to enumerate devices and to open a [`DeviceStream`] for
//! the committed input, then drives that stream from the session thread and
//! the frame pump.

pub mod synthetic;

#[cfg(feature = "native")]
pub mod native;

use crate::errors::CameraError;
use crate::properties::DeviceControls;
use crate::types::{CameraDeviceInfo, CameraFrame, MediaType, ResolvedFormat};
use std::sync::{Arc, Mutex};

pub use synthetic::{SyntheticBackend, SyntheticFaults};

#[cfg(feature = "native")]
pub use native::NokhwaBackend;

/// Completion invoked by a device when a still photo is ready.
///
/// Hardware may invoke it more than once for the same capture; the receiving
/// delegate is responsible for resolving its request exactly once.
pub type PhotoCompletion = Arc<dyn Fn(Result<CameraFrame, CameraError>) + Send + Sync>;

/// Stream shared between the session thread (photos, controls) and the frame
/// pump (preview frames).
pub type SharedStream = Arc<Mutex<Box<dyn DeviceStream>>>;

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Enumerate devices of one media type. Fails with `DeviceUnavailable`
    /// when the OS refuses enumeration.
    fn list_devices(&self, media_type: MediaType) -> Result<Vec<CameraDeviceInfo>, CameraError>;

    /// Open the device in the given format. The stream starts stopped.
    fn open_device(
        &self,
        device: &CameraDeviceInfo,
        format: &ResolvedFormat,
    ) -> Result<Box<dyn DeviceStream>, CameraError>;
}

pub trait DeviceStream: Send {
    fn device_id(&self) -> &str;

    /// Start delivering frames. Turns the hardware indicator on.
    fn start_stream(&mut self) -> Result<(), CameraError>;

    fn stop_stream(&mut self) -> Result<(), CameraError>;

    fn is_streaming(&self) -> bool;

    /// Block until the next frame is available.
    fn capture_frame(&mut self) -> Result<CameraFrame, CameraError>;

    fn apply_controls(&mut self, controls: &DeviceControls) -> Result<(), CameraError>;

    /// Trigger a still capture. The default grabs the next frame and completes
    /// synchronously; devices with a dedicated still pipeline override this
    /// and complete from their own thread.
    fn capture_photo(&mut self, completion: PhotoCompletion) {
        let result = self.capture_frame();
        completion(result);
    }
}

pub(crate) fn lock_stream(
    stream: &SharedStream,
) -> Result<std::sync::MutexGuard<'_, Box<dyn DeviceStream>>, CameraError> {
    stream.lock().map_err(|_| CameraError::poisoned_lock())
}
