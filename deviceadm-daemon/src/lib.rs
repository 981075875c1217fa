//! Device admission service.
//!
//! Startup order matters: open the [`DeviceStore`], run the [`Migrator`] to
//! completion, and only then hand the store to the [`AdmissionController`].
//! Admission traffic must never run against a partially migrated schema.

pub mod admission;
pub mod config;
pub mod db;
pub mod migration;

pub use admission::{AdmissionController, AdmissionError};
pub use config::{Config, ConfigError};
pub use db::{DeviceStore, ListFilter, StoreError};
pub use migration::{Migration, MigrationError, Migrator};
