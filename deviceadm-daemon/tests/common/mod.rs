//! Shared fixtures for deviceadm integration tests.

use chrono::{Duration, Utc};
use deviceadm_core::{Device, DeviceAttributes, DeviceStatus};
use deviceadm_daemon::{Config, DeviceStore, ListFilter};
use rand::Rng;
use tempfile::TempDir;

/// A device store backed by a database file in a temporary directory.
///
/// The directory is removed when the harness is dropped.
pub struct TestStore {
    pub store: DeviceStore,
    _dir: TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Config::for_path(&dir.path().join("deviceadm.db"));
        let store = DeviceStore::open(&config)
            .await
            .expect("Failed to open device store");
        Self { store, _dir: dir }
    }

    /// Insert `count` devices in the pre-1.1.0 shape (no `device_id`).
    ///
    /// Each device gets a random status and a request time up to 1024 hours
    /// in the past.
    pub async fn populate_legacy(&self, count: usize) -> Vec<Device> {
        let mut rng = rand::thread_rng();
        let mut devices = Vec::with_capacity(count);

        for i in 0..count {
            let status = DeviceStatus::ALL[rng.gen_range(0..DeviceStatus::ALL.len())];
            let age = Duration::hours(rng.gen_range(0..1024));

            let mut attributes = DeviceAttributes::new();
            attributes.insert("foo".to_string(), format!("attr-0.1.0-{i}"));

            let mut device = Device::new_pending(
                format!("id-data-0.1.0-{i}"),
                format!("pubkey-0.1.0-{i}"),
                attributes,
                Utc::now() - age,
            );
            device.status = status;
            device.device_id = None;

            self.store
                .insert(&device)
                .await
                .expect("Failed to insert legacy device");
            devices.push(device);
        }

        devices
    }

    /// Every stored device, ordered by ID.
    #[allow(dead_code)]
    pub async fn snapshot(&self) -> Vec<Device> {
        let mut devices = self
            .store
            .list(&ListFilter::default())
            .await
            .expect("Failed to list devices");
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }
}
