//! Device discovery and hot-plug detection
//!
//! [`DeviceDiscovery`] answers point-in-time queries against the capture
//! backend. [`DeviceMonitor`] polls it and reports devices appearing and
//! disappearing.

use crate::errors::CameraError;
use crate::platform::CaptureBackend;
use crate::types::{CameraDeviceInfo, CameraFormat, MediaType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Read-only view of the devices a backend exposes.
#[derive(Clone)]
pub struct DeviceDiscovery {
    backend: Arc<dyn CaptureBackend>,
}

impl DeviceDiscovery {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    /// Devices of one media type, back cameras first, then front, then
    /// external, each group ordered by id.
    pub fn list_devices(&self, media_type: MediaType) -> Result<Vec<CameraDeviceInfo>, CameraError> {
        let mut devices = self.backend.list_devices(media_type)?;
        devices.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        log::debug!(
            "Discovered {} {} device(s) via {}",
            devices.len(),
            media_type,
            self.backend.name()
        );
        Ok(devices)
    }

    pub fn find_device(&self, device_id: &str) -> Result<CameraDeviceInfo, CameraError> {
        for media_type in [MediaType::Video, MediaType::Audio] {
            if let Some(device) = self
                .backend
                .list_devices(media_type)?
                .into_iter()
                .find(|d| d.id == device_id)
            {
                return Ok(device);
            }
        }
        Err(CameraError::DeviceUnavailable(format!(
            "no device with id {device_id}"
        )))
    }

    pub fn formats(&self, device_id: &str) -> Result<Vec<CameraFormat>, CameraError> {
        Ok(self.find_device(device_id)?.formats)
    }
}

/// Device event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "deviceId")]
pub enum DeviceEvent {
    Connected(String),
    Disconnected(String),
}

/// Polls discovery for video devices coming and going
pub struct DeviceMonitor {
    discovery: DeviceDiscovery,
    interval: Duration,
    active_devices: Arc<RwLock<HashMap<String, CameraDeviceInfo>>>,
    event_sender: mpsc::UnboundedSender<DeviceEvent>,
    event_receiver: Arc<RwLock<mpsc::UnboundedReceiver<DeviceEvent>>>,
    is_monitoring: Arc<RwLock<bool>>,
    /// Polling task; aborted on stop and on drop.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(discovery: DeviceDiscovery) -> Self {
        Self::with_interval(discovery, Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(discovery: DeviceDiscovery, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            discovery,
            interval,
            active_devices: Arc::new(RwLock::new(HashMap::new())),
            event_sender: tx,
            event_receiver: Arc::new(RwLock::new(rx)),
            is_monitoring: Arc::new(RwLock::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start monitoring for device changes. Devices present at start are
    /// recorded without events.
    pub async fn start_monitoring(&self) -> Result<(), CameraError> {
        let mut is_monitoring = self.is_monitoring.write().await;
        if *is_monitoring {
            return Ok(());
        }

        log::info!(
            "Starting device monitoring via {} (every {:?})",
            self.discovery.backend().name(),
            self.interval
        );

        let initial = scan(&self.discovery).await?;
        {
            let mut active = self.active_devices.write().await;
            active.clear();
            active.extend(initial.into_iter().map(|d| (d.id.clone(), d)));
        }

        let discovery = self.discovery.clone();
        let interval = self.interval;
        let active_devices = self.active_devices.clone();
        let event_sender = self.event_sender.clone();
        let monitoring = self.is_monitoring.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !*monitoring.read().await {
                    break;
                }
                match scan(&discovery).await {
                    Ok(devices) => {
                        let mut active = active_devices.write().await;
                        apply_scan(&mut active, devices, &event_sender);
                    }
                    Err(e) => log::debug!("Device scan failed: {}", e),
                }
            }
            log::debug!("Device monitor task exited");
        });
        self.replace_task(Some(task));

        *is_monitoring = true;
        Ok(())
    }

    /// Stop monitoring for device changes
    pub async fn stop_monitoring(&self) -> Result<(), CameraError> {
        let mut is_monitoring = self.is_monitoring.write().await;
        if !*is_monitoring {
            return Ok(());
        }

        log::info!("Stopping device monitoring");
        *is_monitoring = false;
        self.replace_task(None);
        Ok(())
    }

    fn replace_task(&self, task: Option<JoinHandle<()>>) {
        let previous = match self.task.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, task),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), task),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        *self.is_monitoring.read().await
    }

    /// Scan once now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<(), CameraError> {
        let devices = scan(&self.discovery).await?;
        let mut active = self.active_devices.write().await;
        apply_scan(&mut active, devices, &self.event_sender);
        Ok(())
    }

    /// Get next device event (non-blocking)
    pub async fn poll_event(&self) -> Option<DeviceEvent> {
        let mut rx = self.event_receiver.write().await;
        rx.try_recv().ok()
    }

    /// Wait for next device event
    pub async fn wait_for_event(&self) -> Option<DeviceEvent> {
        let mut rx = self.event_receiver.write().await;
        rx.recv().await
    }

    /// Get list of currently active devices
    pub async fn get_active_devices(&self) -> Vec<CameraDeviceInfo> {
        let devices = self.active_devices.read().await;
        let mut devices: Vec<_> = devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.replace_task(None);
    }
}

async fn scan(discovery: &DeviceDiscovery) -> Result<Vec<CameraDeviceInfo>, CameraError> {
    let discovery = discovery.clone();
    tokio::task::spawn_blocking(move || discovery.list_devices(MediaType::Video))
        .await
        .map_err(|e| CameraError::DeviceUnavailable(format!("device scan task failed: {e}")))?
}

fn apply_scan(
    active: &mut HashMap<String, CameraDeviceInfo>,
    devices: Vec<CameraDeviceInfo>,
    event_sender: &mpsc::UnboundedSender<DeviceEvent>,
) {
    let new_ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();

    let mut gone: Vec<String> = active
        .keys()
        .filter(|id| !new_ids.contains(id))
        .cloned()
        .collect();
    gone.sort();
    for id in gone {
        log::info!("Device disconnected: {}", id);
        active.remove(&id);
        let _ = event_sender.send(DeviceEvent::Disconnected(id));
    }

    for device in devices {
        if !active.contains_key(&device.id) {
            log::info!("Device connected: {}", device.id);
            let _ = event_sender.send(DeviceEvent::Connected(device.id.clone()));
        }
        active.insert(device.id.clone(), device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SyntheticBackend;
    use crate::types::DevicePosition;
    use std::sync::atomic::Ordering;

    fn discovery() -> (DeviceDiscovery, Arc<SyntheticBackend>) {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        (DeviceDiscovery::new(backend.clone()), backend)
    }

    #[test]
    fn test_list_devices_ordered_by_position() {
        let (discovery, backend) = discovery();
        backend.add_device(
            CameraDeviceInfo::new("usb-0", "USB Webcam").with_position(DevicePosition::External),
        );

        let devices = discovery.list_devices(MediaType::Video).unwrap();
        let positions: Vec<_> = devices.iter().map(|d| d.position).collect();
        assert_eq!(
            positions,
            vec![
                DevicePosition::Back,
                DevicePosition::Front,
                DevicePosition::External
            ]
        );
    }

    #[test]
    fn test_formats_for_unknown_device() {
        let (discovery, _backend) = discovery();
        assert!(matches!(
            discovery.formats("missing"),
            Err(CameraError::DeviceUnavailable(_))
        ));
        assert!(!discovery.formats("synthetic-back").unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_denied() {
        let (discovery, backend) = discovery();
        backend.faults().deny_enumeration.store(true, Ordering::SeqCst);
        assert!(matches!(
            discovery.list_devices(MediaType::Video),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_reports_changes() {
        let (discovery, backend) = discovery();
        let monitor = DeviceMonitor::with_interval(discovery, Duration::from_secs(3600));
        monitor.start_monitoring().await.unwrap();
        assert_eq!(monitor.get_active_devices().await.len(), 2);
        assert_eq!(monitor.poll_event().await, None);

        backend.add_device(CameraDeviceInfo::new("usb-1", "USB Webcam"));
        backend.remove_device("synthetic-front");
        monitor.refresh().await.unwrap();

        assert_eq!(
            monitor.poll_event().await,
            Some(DeviceEvent::Disconnected("synthetic-front".to_string()))
        );
        assert_eq!(
            monitor.poll_event().await,
            Some(DeviceEvent::Connected("usb-1".to_string()))
        );
        monitor.stop_monitoring().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (discovery, _backend) = discovery();
        let monitor = DeviceMonitor::new(discovery);
        monitor.start_monitoring().await.unwrap();
        monitor.start_monitoring().await.unwrap();
        assert!(monitor.is_monitoring().await);
        monitor.stop_monitoring().await.unwrap();
        monitor.stop_monitoring().await.unwrap();
        assert!(!monitor.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_polling_task_detects_new_device() {
        let (discovery, backend) = discovery();
        let monitor = DeviceMonitor::with_interval(discovery, Duration::from_millis(50));
        monitor.start_monitoring().await.unwrap();

        backend.add_device(CameraDeviceInfo::new("usb-2", "Capture Card"));
        let event = tokio::time::timeout(Duration::from_secs(5), monitor.wait_for_event())
            .await
            .unwrap();
        assert_eq!(event, Some(DeviceEvent::Connected("usb-2".to_string())));
        monitor.stop_monitoring().await.unwrap();
    }
}
