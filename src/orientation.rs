//! Device orientation source used when capture orientation is not locked.

use crate::properties::DeviceOrientation;
use std::sync::Mutex;

pub trait DeviceOrientationProvider: Send + Sync {
    fn orientation(&self) -> DeviceOrientation;
}

/// Orientation set by the host (or fixed for headless use).
#[derive(Debug, Default)]
pub struct FixedOrientation {
    current: Mutex<DeviceOrientation>,
}

impl FixedOrientation {
    pub fn new(orientation: DeviceOrientation) -> Self {
        Self {
            current: Mutex::new(orientation),
        }
    }

    pub fn set(&self, orientation: DeviceOrientation) {
        if let Ok(mut current) = self.current.lock() {
            *current = orientation;
        }
    }
}

impl DeviceOrientationProvider for FixedOrientation {
    fn orientation(&self) -> DeviceOrientation {
        self.current
            .lock()
            .map(|o| *o)
            .unwrap_or_default()
    }
}
