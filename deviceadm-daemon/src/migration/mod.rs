//! Versioned migrations over the device collection.
//!
//! Each [`Migration`] is tagged with the schema version it produces. The
//! [`Migrator`] keeps them sorted ascending and, on [`Migrator::up`], applies
//! every migration newer than the stored schema version and no newer than the
//! target, one at a time, recording the version after each one completes.
//!
//! Re-running is safe without checkpoints: a migration only rewrites records
//! for which [`Migration::needs_transform`] holds, and its transform makes that
//! predicate false.

use deviceadm_core::{AuthId, Device, SchemaVersion};
use tokio_stream::StreamExt;

use crate::db::{DeviceStore, StoreError};

mod m1_1_0_device_id;

pub use m1_1_0_device_id::BackfillDeviceId;

/// A single schema revision applied record by record.
pub trait Migration: Send + Sync {
    /// Schema version reached once this migration has been applied.
    fn version(&self) -> SchemaVersion;

    /// Short human-readable description for logs.
    fn name(&self) -> &'static str;

    /// Returns true if `device` has not yet been migrated.
    fn needs_transform(&self, device: &Device) -> bool;

    /// Produce the migrated record. Must not change the device ID.
    fn transform(&self, device: Device) -> Device;
}

/// Built-in migrations, in any order.
pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(BackfillDeviceId)]
}

/// Errors that abort a migration run.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration {0} registered more than once")]
    DuplicateVersion(SchemaVersion),

    #[error("stored schema version {current} is newer than target {target}")]
    SchemaAhead {
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error("migration {version}: failed to read devices: {source}")]
    Read {
        version: SchemaVersion,
        #[source]
        source: StoreError,
    },

    #[error("migration {version}: failed to write device {device}: {source}")]
    Write {
        version: SchemaVersion,
        device: AuthId,
        #[source]
        source: StoreError,
    },

    #[error("migration {version}: transform changed the ID of device {device}")]
    ImmutableId {
        version: SchemaVersion,
        device: AuthId,
    },

    #[error("migration {version}: record count changed from {before} to {after}")]
    RecordCountChanged {
        version: SchemaVersion,
        before: u64,
        after: u64,
    },

    #[error("schema version marker: {0}")]
    Store(#[from] StoreError),
}

/// Applies registered migrations to a [`DeviceStore`].
pub struct Migrator {
    store: DeviceStore,
    /// Sorted ascending by version, no duplicates.
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Create a migrator with no registered migrations.
    pub fn new(store: DeviceStore) -> Self {
        Self {
            store,
            migrations: Vec::new(),
        }
    }

    /// Create a migrator with every built-in migration registered.
    pub fn with_builtin(store: DeviceStore) -> Result<Self, MigrationError> {
        migrations()
            .into_iter()
            .try_fold(Self::new(store), |migrator, m| migrator.register(m))
    }

    /// Register a migration, keeping the list sorted by version.
    pub fn register(mut self, migration: Box<dyn Migration>) -> Result<Self, MigrationError> {
        let version = migration.version();
        match self
            .migrations
            .binary_search_by_key(&version, |m| m.version())
        {
            Ok(_) => Err(MigrationError::DuplicateVersion(version)),
            Err(pos) => {
                self.migrations.insert(pos, migration);
                Ok(self)
            }
        }
    }

    /// Registered versions in application order.
    pub fn registered(&self) -> Vec<SchemaVersion> {
        self.migrations.iter().map(|m| m.version()).collect()
    }

    /// Highest registered version, or 0.0.0 if nothing is registered.
    pub fn latest_version(&self) -> SchemaVersion {
        self.migrations
            .last()
            .map(|m| m.version())
            .unwrap_or(SchemaVersion::ZERO)
    }

    /// Migrations with `current < version <= target`, ascending.
    pub fn pending(
        &self,
        current: SchemaVersion,
        target: SchemaVersion,
    ) -> impl Iterator<Item = &dyn Migration> {
        self.migrations
            .iter()
            .map(|m| m.as_ref() as &dyn Migration)
            .filter(move |m| m.version() > current && m.version() <= target)
    }

    /// Migrate to the highest registered version.
    pub async fn up_to_latest(&self) -> Result<Vec<SchemaVersion>, MigrationError> {
        self.up(self.latest_version()).await
    }

    /// Migrate the store to `target`.
    ///
    /// Returns the versions applied by this call. On error the stored schema
    /// version stays at the last migration that fully completed.
    pub async fn up(&self, target: SchemaVersion) -> Result<Vec<SchemaVersion>, MigrationError> {
        let current = self.store.schema_version().await?;
        if current > target {
            return Err(MigrationError::SchemaAhead { current, target });
        }

        tracing::info!(current = %current, target = %target, "Checking schema migrations");

        let mut applied = Vec::new();
        for migration in self.pending(current, target) {
            self.apply(migration).await?;
            self.store.record_schema_version(migration.version()).await?;
            applied.push(migration.version());
        }

        if applied.is_empty() {
            tracing::info!(version = %current, "Schema up to date");
        }
        Ok(applied)
    }

    /// Run one migration over the whole collection.
    async fn apply(&self, migration: &dyn Migration) -> Result<(), MigrationError> {
        let version = migration.version();
        let read_err = |source: StoreError| MigrationError::Read { version, source };

        tracing::info!(version = %version, name = migration.name(), "Applying migration");

        let before = self.store.count().await.map_err(read_err)?;
        let mut examined: u64 = 0;
        let mut transformed: u64 = 0;

        let records = self.store.iterate();
        tokio::pin!(records);
        while let Some(device) = records.next().await {
            let device = device.map_err(read_err)?;
            examined += 1;

            if !migration.needs_transform(&device) {
                continue;
            }

            let id = device.id.clone();
            let updated = migration.transform(device);
            if updated.id != id {
                return Err(MigrationError::ImmutableId {
                    version,
                    device: id,
                });
            }

            self.store
                .replace(&updated)
                .await
                .map_err(|source| MigrationError::Write {
                    version,
                    device: id,
                    source,
                })?;
            transformed += 1;
        }

        let after = self.store.count().await.map_err(read_err)?;
        if before != after {
            return Err(MigrationError::RecordCountChanged {
                version,
                before,
                after,
            });
        }

        tracing::info!(
            version = %version,
            examined,
            transformed,
            "Migration complete"
        );
        Ok(())
    }
}
