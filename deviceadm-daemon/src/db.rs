//! Device store backed by SQLite.
//!
//! Wraps SQLite access via sqlx. The `devices` table is keyed by the
//! device AuthId; its primary-key index is the only concurrency control the
//! admission workflow relies on. Each statement writes a single row, so every
//! write is atomic at record granularity.

use std::str::FromStr;

use async_stream::try_stream;
use chrono::{DateTime, SecondsFormat, Utc};
use deviceadm_core::{AuthId, Device, DeviceAttributes, DeviceId, DeviceStatus, SchemaVersion};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tokio_stream::Stream;

use crate::config::Config;

/// Number of records fetched per page by [`DeviceStore::iterate`].
pub const ITERATE_PAGE_SIZE: i64 = 100;

const DEVICE_COLUMNS: &str =
    "id, device_identity, key, status, request_time, attributes, device_id";

/// Errors that can occur during device store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("device not found: {0}")]
    NotFound(AuthId),
    #[error("device already exists: {0}")]
    Conflict(AuthId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt device record: {0}")]
    Decode(String),
}

/// Filter for [`DeviceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<DeviceStatus>,
    pub skip: u32,
    /// Maximum number of records; `None` returns everything after `skip`.
    pub limit: Option<u32>,
}

/// Durable storage for device records and the schema version marker.
///
/// Cloning is cheap and shares the underlying connection pool.
#[derive(Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl DeviceStore {
    /// Open (or create) the database named by the configuration.
    pub async fn open(config: &Config) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            // WAL mode for better concurrent read performance
            .journal_mode(SqliteJournalMode::Wal)
            // NORMAL sync balances durability vs speed
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        tracing::info!(url = %config.database_url, "Device store opened");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables if they don't exist.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY NOT NULL,
                device_identity TEXT NOT NULL,
                key TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
                request_time TEXT NOT NULL,
                attributes TEXT NOT NULL,
                device_id TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_status ON devices (status)")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_info (
                major INTEGER NOT NULL,
                minor INTEGER NOT NULL,
                patch INTEGER NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (major, minor, patch)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Close the pool, waiting for in-flight statements to finish.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Device store closed");
    }

    #[cfg(test)]
    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Device CRUD Operations
    // =========================================================================

    /// Insert a new device.
    ///
    /// Fails with [`StoreError::Conflict`] if a record with the same ID exists.
    pub async fn insert(&self, device: &Device) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO devices (
                id, device_identity, key, status, request_time, attributes, device_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(device.id.as_str())
        .bind(&device.device_identity)
        .bind(&device.key)
        .bind(device.status.as_str())
        .bind(format_time(&device.request_time))
        .bind(encode_attributes(&device.attributes)?)
        .bind(device.device_id.as_ref().map(DeviceId::as_str))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(device.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a device by ID.
    pub async fn get(&self, id: &AuthId) -> Result<Device, StoreError> {
        let row = sqlx::query(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => parse_device_row(&row),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    /// Replace the status of a device.
    pub async fn update_status(&self, id: &AuthId, status: DeviceStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE devices SET status = ?2 WHERE id = ?1")
            .bind(id.as_str())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// Record a repeated admission request: new request time and attributes,
    /// status untouched.
    pub async fn update_request(
        &self,
        id: &AuthId,
        request_time: DateTime<Utc>,
        attributes: &DeviceAttributes,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE devices SET request_time = ?2, attributes = ?3 WHERE id = ?1")
                .bind(id.as_str())
                .bind(format_time(&request_time))
                .bind(encode_attributes(attributes)?)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// Overwrite every mutable field of an existing device.
    ///
    /// The ID itself is the lookup key and never changes.
    pub async fn replace(&self, device: &Device) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                device_identity = ?2,
                key = ?3,
                status = ?4,
                request_time = ?5,
                attributes = ?6,
                device_id = ?7
            WHERE id = ?1
            "#,
        )
        .bind(device.id.as_str())
        .bind(&device.device_identity)
        .bind(&device.key)
        .bind(device.status.as_str())
        .bind(format_time(&device.request_time))
        .bind(encode_attributes(&device.attributes)?)
        .bind(device.device_id.as_ref().map(DeviceId::as_str))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(device.id.clone()));
        }
        Ok(())
    }

    /// Delete a device.
    pub async fn delete(&self, id: &AuthId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    /// List devices, most recent request first.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Device>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit"
        let limit = filter.limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEVICE_COLUMNS}
            FROM devices
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY request_time DESC, id
            LIMIT ?2 OFFSET ?3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(i64::from(filter.skip))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(parse_device_row).collect()
    }

    /// Count all device records.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Stream every device record in ID order.
    ///
    /// Records are fetched in pages of [`ITERATE_PAGE_SIZE`] using the last
    /// seen ID as the cursor, so the collection is never held in memory and no
    /// connection is held between pages. Each call starts from the beginning.
    pub fn iterate(&self) -> impl Stream<Item = Result<Device, StoreError>> + Send + '_ {
        try_stream! {
            let mut after = String::new();
            loop {
                let rows = sqlx::query(&format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices WHERE id > ?1 ORDER BY id LIMIT ?2"
                ))
                .bind(&after)
                .bind(ITERATE_PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?;

                let page_len = rows.len();
                for row in rows {
                    let device = parse_device_row(&row)?;
                    after = device.id.0.clone();
                    yield device;
                }

                if (page_len as i64) < ITERATE_PAGE_SIZE {
                    break;
                }
            }
        }
    }

    // =========================================================================
    // Schema Version Marker
    // =========================================================================

    /// Highest schema version recorded, or 0.0.0 if no migration has completed.
    pub async fn schema_version(&self) -> Result<SchemaVersion, StoreError> {
        let row = sqlx::query(
            "SELECT major, minor, patch FROM migration_info
             ORDER BY major DESC, minor DESC, patch DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(SchemaVersion::new(
                version_part(&row, "major")?,
                version_part(&row, "minor")?,
                version_part(&row, "patch")?,
            )),
            None => Ok(SchemaVersion::ZERO),
        }
    }

    /// Record that the migration to `version` has completed.
    pub async fn record_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO migration_info (major, minor, patch, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(i64::from(version.major))
        .bind(i64::from(version.minor))
        .bind(i64::from(version.patch))
        .bind(format_time(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Fixed-width RFC 3339 so that lexical order equals chronological order.
fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode_attributes(attributes: &DeviceAttributes) -> Result<String, StoreError> {
    serde_json::to_string(attributes)
        .map_err(|e| StoreError::Decode(format!("Unencodable attributes: {}", e)))
}

fn version_part(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| {
        StoreError::Decode(format!("schema version {column} out of range: {value}"))
    })
}

/// Parse a database row into a Device.
fn parse_device_row(row: &SqliteRow) -> Result<Device, StoreError> {
    let id = AuthId::new(row.try_get::<String, _>("id")?);

    let status_str: String = row.try_get("status")?;
    let status = DeviceStatus::from_str(&status_str)
        .map_err(|e| StoreError::Decode(format!("{}: {}", id, e)))?;

    let request_time_str: String = row.try_get("request_time")?;
    let request_time = DateTime::parse_from_rfc3339(&request_time_str)
        .map_err(|e| StoreError::Decode(format!("{}: invalid request_time: {}", id, e)))?
        .with_timezone(&Utc);

    let attributes_json: String = row.try_get("attributes")?;
    let attributes: DeviceAttributes = serde_json::from_str(&attributes_json)
        .map_err(|e| StoreError::Decode(format!("{}: invalid attributes JSON: {}", id, e)))?;

    let device_id = row
        .try_get::<Option<String>, _>("device_id")?
        .map(DeviceId::new);

    Ok(Device {
        id,
        key: row.try_get("key")?,
        device_identity: row.try_get("device_identity")?,
        status,
        request_time,
        attributes,
        device_id,
    })
}
