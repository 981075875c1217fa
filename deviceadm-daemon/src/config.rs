//! Service configuration.
//!
//! Built once at startup, before the store, migration engine or admission
//! controller exist, and passed to them explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of pooled SQLite connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Validated service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Storage connection endpoint, e.g. `sqlite:/var/lib/deviceadm/deviceadm.db`.
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// Deadline for startup migrations. `None` waits for completion.
    pub migration_deadline: Option<Duration>,
}

/// Errors raised while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("database URL must use the sqlite: scheme, got {0:?}")]
    UnsupportedDatabaseUrl(String),
    #[error("max connections must be at least 1")]
    NoConnections,
    #[error("migration deadline must be greater than zero")]
    ZeroDeadline,
}

impl Config {
    /// Build and validate a configuration.
    pub fn new(
        database_url: impl Into<String>,
        max_connections: u32,
        migration_deadline: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            database_url: database_url.into(),
            max_connections,
            migration_deadline,
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a database file at `path`, with default settings.
    pub fn for_path(path: &Path) -> Self {
        Self {
            database_url: database_url_for(path),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            migration_deadline: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.database_url.starts_with("sqlite:") {
            return Err(ConfigError::UnsupportedDatabaseUrl(
                self.database_url.clone(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.migration_deadline == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroDeadline);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_path(&default_database_path())
    }
}

/// `<local data dir>/deviceadm/deviceadm.db`, falling back to the working directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deviceadm")
        .join("deviceadm.db")
}

/// Database URL for a SQLite file, created on first open.
pub fn database_url_for(path: &Path) -> String {
    format!("sqlite:{}?mode=rwc", path.display())
}
