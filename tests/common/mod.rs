//! Shared fixtures for the integration tests: a synthetic backend, scripted
//! permissions and a temp output directory wired into one environment.

#![allow(dead_code)]

use camcore::config::CamCoreConfig;
use camcore::permissions::FixedPermissions;
use camcore::platform::SyntheticBackend;
use camcore::{CameraEnvironment, MediaSettings, ResolutionPreset};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Rig {
    pub backend: Arc<SyntheticBackend>,
    pub permissions: Arc<FixedPermissions>,
    pub env: CameraEnvironment,
    pub dir: TempDir,
}

pub fn rig() -> Rig {
    rig_with(FixedPermissions::authorized(), |_| {})
}

pub fn rig_with(permissions: FixedPermissions, tweak: impl FnOnce(&mut CamCoreConfig)) -> Rig {
    let backend = Arc::new(SyntheticBackend::with_default_devices());
    let permissions = Arc::new(permissions);
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = CamCoreConfig::default();
    config.storage.output_directory = dir.path().to_string_lossy().into_owned();
    config.storage.organize_by_date = false;
    config.session.close_timeout_ms = 2000;
    tweak(&mut config);

    let env = CameraEnvironment::new(backend.clone(), permissions.clone()).with_config(config);
    Rig {
        backend,
        permissions,
        env,
        dir,
    }
}

impl Rig {
    pub fn unpaced(self) -> Self {
        self.backend.faults().unpaced.store(true, Ordering::SeqCst);
        self
    }

    /// Files written to the output directory.
    pub fn saved_files(&self) -> Vec<std::path::PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(self.dir.path())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }
}

/// Smallest preset, keeps photo encoding fast.
pub fn low_settings() -> MediaSettings {
    MediaSettings::new(ResolutionPreset::Low)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
