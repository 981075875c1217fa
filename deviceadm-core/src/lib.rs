//! # Device Admission Core
//!
//! Pure domain types for the device admission service.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! All types are plain Rust structs/enums with serde serialization. Persistence,
//! schema migrations and the admission workflow live in `deviceadm-daemon`.
//!
//! ## Stability
//!
//! The serde representation of [`Device`] and [`DeviceStatus`] is the stored
//! and printed format. Changing a field name or enum spelling requires a schema
//! migration in the daemon.
//!
//! ## Modules
//!
//! - [`device`] - Device records, identifiers and the admission state machine
//! - [`version`] - Schema version markers

pub mod device;
pub mod version;

pub use device::{
    validate_submission, Admission, AuthId, Device, DeviceAttributes, DeviceId, DeviceStatus,
    ParseStatusError, ValidationError,
};
pub use version::{ParseVersionError, SchemaVersion};
