use super::output::OutputId;
use crate::properties::{DeviceOrientation, VideoStabilization};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u32);

/// Binds the session input to one output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureConnection {
    pub id: ConnectionId,
    pub input_device_id: String,
    pub output_id: OutputId,
    pub enabled: bool,
    pub mirrored: bool,
    pub orientation: DeviceOrientation,
    pub stabilization: VideoStabilization,
}

impl CaptureConnection {
    pub fn new(id: ConnectionId, input_device_id: impl Into<String>, output_id: OutputId) -> Self {
        Self {
            id,
            input_device_id: input_device_id.into(),
            output_id,
            enabled: true,
            mirrored: false,
            orientation: DeviceOrientation::default(),
            stabilization: VideoStabilization::Off,
        }
    }

    pub fn rotation_degrees(&self) -> u16 {
        self.orientation.rotation_degrees()
    }
}
