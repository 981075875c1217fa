//! Admission workflow: device submissions and accept/reject decisions.
//!
//! There is no in-process locking. Every operation is one or two single-row
//! store calls, and concurrent writers to the same device race at the store:
//! the last completed write wins for the fields it touches. A heartbeat racing
//! an accept can therefore leave either order's result, but never a partially
//! written record.

use chrono::Utc;
use deviceadm_core::{
    validate_submission, Admission, AuthId, Device, DeviceAttributes, ValidationError,
};

use crate::db::{DeviceStore, ListFilter, StoreError};

/// Errors surfaced to callers of the admission controller.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("device not found: {0}")]
    NotFound(AuthId),
    #[error("device {0} is registered with different credentials")]
    Conflict(AuthId),
    #[error("invalid admission request: {0}")]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

impl AdmissionError {
    /// Returns true for outcomes caused by the request itself rather than the
    /// service (not found, conflict, validation).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict(id) => Self::Conflict(id),
            other => Self::Storage(other),
        }
    }
}

/// Orchestrates device admission on top of a [`DeviceStore`].
#[derive(Clone)]
pub struct AdmissionController {
    store: DeviceStore,
}

impl AdmissionController {
    pub fn new(store: DeviceStore) -> Self {
        Self { store }
    }

    /// Handle an admission request from a device.
    ///
    /// The first request for an (identity, key) pair creates a Pending device.
    /// Later requests with the same pair refresh the request time and
    /// attributes and keep the current status. A stored record whose ID matches
    /// but whose credentials differ is a conflict.
    ///
    /// A device deleted between the rejected insert and the heartbeat update
    /// surfaces as [`AdmissionError::NotFound`]. The request is not retried;
    /// resubmitting creates a fresh Pending device.
    pub async fn submit(
        &self,
        identity: &str,
        key: &str,
        attributes: DeviceAttributes,
    ) -> Result<Device, AdmissionError> {
        validate_submission(identity, key, &attributes)?;

        let now = Utc::now();
        let device = Device::new_pending(identity, key, attributes, now);

        // The insert decides who created the record
        match self.store.insert(&device).await {
            Ok(()) => {
                tracing::info!(device_id = %device.id, "New device pending admission");
                return Ok(device);
            }
            Err(StoreError::Conflict(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut existing = self.store.get(&device.id).await?;
        if !existing.matches_credentials(identity, key) {
            tracing::warn!(
                device_id = %device.id,
                "Admission request conflicts with stored device credentials"
            );
            return Err(AdmissionError::Conflict(device.id));
        }

        self.store
            .update_request(&existing.id, now, &device.attributes)
            .await?;
        tracing::debug!(device_id = %existing.id, status = %existing.status, "Device heartbeat");

        existing.request_time = now;
        existing.attributes = device.attributes;
        Ok(existing)
    }

    /// Admit a device. Allowed from any status.
    pub async fn accept(&self, id: &AuthId) -> Result<(), AdmissionError> {
        self.set_status(id, Admission::Accept).await
    }

    /// Refuse a device. Allowed from any status.
    pub async fn reject(&self, id: &AuthId) -> Result<(), AdmissionError> {
        self.set_status(id, Admission::Reject).await
    }

    /// Apply an admission decision.
    pub async fn set_status(&self, id: &AuthId, admission: Admission) -> Result<(), AdmissionError> {
        let status = admission.target();
        self.store.update_status(id, status).await?;
        tracing::info!(device_id = %id, status = %status, "Device status changed");
        Ok(())
    }

    pub async fn get_device(&self, id: &AuthId) -> Result<Device, AdmissionError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_devices(&self, filter: &ListFilter) -> Result<Vec<Device>, AdmissionError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn delete_device(&self, id: &AuthId) -> Result<(), AdmissionError> {
        self.store.delete(id).await?;
        tracing::info!(device_id = %id, "Device deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use deviceadm_core::DeviceStatus;
    use tempfile::{tempdir, TempDir};

    async fn test_controller() -> (AdmissionController, DeviceStore, TempDir) {
        let dir = tempdir().unwrap();
        let config = Config::for_path(&dir.path().join("test.db"));
        let store = DeviceStore::open(&config).await.unwrap();
        (AdmissionController::new(store.clone()), store, dir)
    }

    fn attrs(pairs: &[(&str, &str)]) -> DeviceAttributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_submit_creates_pending_device() {
        let (controller, store, _dir) = test_controller().await;

        let device = controller
            .submit("mac=00:11:22", "pubkey", attrs(&[("fw", "1.0")]))
            .await
            .unwrap();

        assert_eq!(device.id, AuthId::derive("mac=00:11:22", "pubkey"));
        assert_eq!(device.status, DeviceStatus::Pending);
        assert!(device.device_id.is_some());
        assert_eq!(store.get(&device.id).await.unwrap(), device);
    }

    #[tokio::test]
    async fn test_resubmission_is_heartbeat() {
        let (controller, store, _dir) = test_controller().await;

        let first = controller
            .submit("mac=00:11:22", "pubkey", attrs(&[("fw", "1.0"), ("hw", "a")]))
            .await
            .unwrap();
        controller.accept(&first.id).await.unwrap();

        let second = controller
            .submit("mac=00:11:22", "pubkey", attrs(&[("fw", "2.0")]))
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.device_id, first.device_id);
        assert_eq!(second.status, DeviceStatus::Accepted);
        assert!(second.request_time >= first.request_time);
        assert_eq!(second.attributes, attrs(&[("fw", "2.0")]));

        assert_eq!(store.get(&first.id).await.unwrap(), second);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_with_altered_record_conflicts() {
        let (controller, store, _dir) = test_controller().await;

        // A stored record under this AuthId with different credentials
        let mut tampered = Device::new_pending(
            "mac=00:11:22",
            "pubkey",
            DeviceAttributes::new(),
            Utc::now(),
        );
        tampered.key = "another-key".to_string();
        store.insert(&tampered).await.unwrap();

        let result = controller
            .submit("mac=00:11:22", "pubkey", DeviceAttributes::new())
            .await;
        assert!(matches!(result, Err(AdmissionError::Conflict(id)) if id == tampered.id));

        // Nothing was overwritten
        assert_eq!(store.get(&tampered.id).await.unwrap(), tampered);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (controller, store, _dir) = test_controller().await;

        let result = controller.submit("", "pubkey", DeviceAttributes::new()).await;
        assert!(matches!(
            result,
            Err(AdmissionError::Validation(ValidationError::MissingIdentity))
        ));

        let result = controller
            .submit("mac=00:11:22", " ", DeviceAttributes::new())
            .await;
        assert!(matches!(
            result,
            Err(AdmissionError::Validation(ValidationError::MissingKey))
        ));

        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transitions_are_total() {
        let (controller, store, _dir) = test_controller().await;
        let device = controller
            .submit("mac=00:11:22", "pubkey", DeviceAttributes::new())
            .await
            .unwrap();

        for start in DeviceStatus::ALL {
            for admission in [Admission::Accept, Admission::Reject] {
                store.update_status(&device.id, start).await.unwrap();

                controller.set_status(&device.id, admission).await.unwrap();
                assert_eq!(
                    store.get(&device.id).await.unwrap().status,
                    admission.target(),
                    "{admission:?} from {start:?}"
                );

                // Idempotent once in the target state
                controller.set_status(&device.id, admission).await.unwrap();
                assert_eq!(
                    store.get(&device.id).await.unwrap().status,
                    admission.target()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (controller, _store, _dir) = test_controller().await;
        let id = AuthId::derive("nobody", "nokey");

        for result in [
            controller.accept(&id).await,
            controller.reject(&id).await,
            controller.delete_device(&id).await,
        ] {
            let err = result.unwrap_err();
            assert!(matches!(&err, AdmissionError::NotFound(missing) if *missing == id));
            assert!(err.is_client_error());
        }

        assert!(matches!(
            controller.get_device(&id).await,
            Err(AdmissionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (controller, _store, _dir) = test_controller().await;
        let a = controller
            .submit("dev-a", "key-a", DeviceAttributes::new())
            .await
            .unwrap();
        let b = controller
            .submit("dev-b", "key-b", DeviceAttributes::new())
            .await
            .unwrap();
        controller.reject(&b.id).await.unwrap();

        let pending = controller
            .list_devices(&ListFilter {
                status: Some(DeviceStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);

        controller.delete_device(&a.id).await.unwrap();
        let remaining = controller
            .list_devices(&ListFilter::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
        assert_eq!(remaining[0].status, DeviceStatus::Rejected);

        // A deleted device starts over as Pending
        let again = controller
            .submit("dev-a", "key-a", DeviceAttributes::new())
            .await
            .unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(again.status, DeviceStatus::Pending);
    }

    #[test]
    fn test_error_classification() {
        let id = AuthId::derive("a", "b");
        assert!(AdmissionError::NotFound(id.clone()).is_client_error());
        assert!(AdmissionError::Conflict(id.clone()).is_client_error());
        assert!(AdmissionError::Validation(ValidationError::MissingKey).is_client_error());
        assert!(!AdmissionError::Storage(StoreError::Decode("bad".into())).is_client_error());

        assert!(matches!(
            AdmissionError::from(StoreError::Conflict(id.clone())),
            AdmissionError::Conflict(_)
        ));
        assert!(matches!(
            AdmissionError::from(StoreError::NotFound(id)),
            AdmissionError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_on_vanished_device_is_not_found() {
        let (controller, store, _dir) = test_controller().await;
        let device = controller
            .submit("mac=00:11:22", "pubkey", DeviceAttributes::new())
            .await
            .unwrap();

        // The heartbeat update matches no row, as if the device had been
        // deleted right after the insert conflict
        sqlx::query(
            "CREATE TRIGGER skip_device_updates BEFORE UPDATE ON devices
             BEGIN SELECT RAISE(IGNORE); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = controller
            .submit("mac=00:11:22", "pubkey", attrs(&[("fw", "2.0")]))
            .await;
        assert!(matches!(result, Err(AdmissionError::NotFound(id)) if id == device.id));
        assert_eq!(store.get(&device.id).await.unwrap(), device);
    }
}
