//! 1.1.0: introduce `device_id`.
//!
//! Devices created before this revision have no `device_id`. They are given
//! their AuthId as a stable device identifier; records that already carry one
//! are left untouched.

use deviceadm_core::{Device, DeviceId, SchemaVersion};

use super::Migration;

pub struct BackfillDeviceId;

impl Migration for BackfillDeviceId {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 1, 0)
    }

    fn name(&self) -> &'static str {
        "backfill device_id"
    }

    fn needs_transform(&self, device: &Device) -> bool {
        device
            .device_id
            .as_ref()
            .map_or(true, |id| id.as_str().is_empty())
    }

    fn transform(&self, mut device: Device) -> Device {
        device.device_id = Some(DeviceId::from(&device.id));
        device
    }
}
