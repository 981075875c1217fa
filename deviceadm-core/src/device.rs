//! Device records and the admission state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Primary key of a device record.
///
/// Derived deterministically from the pair (identity, key) so that a device
/// re-submitting the same credentials always lands on the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthId(pub String);

impl AuthId {
    /// Wrap an already-derived identifier (e.g. read back from storage).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier for an (identity, key) pair.
    ///
    /// Each part is prefixed with its length as a big-endian u64 before
    /// hashing, so no two distinct pairs share an encoding.
    pub fn derive(identity: &str, key: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [identity, key] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable device identifier, independent of the credentials the device
/// authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Records that predate the `DeviceId` field are backfilled with their AuthId.
impl From<&AuthId> for DeviceId {
    fn from(id: &AuthId) -> Self {
        Self(id.0.clone())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device-reported metadata, replaced wholesale on every admission request.
pub type DeviceAttributes = BTreeMap<String, String>;

// ============================================================================
// Admission State Machine
// ============================================================================

/// Admission status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Awaiting an admission decision.
    Pending,
    /// Trusted to use the network.
    Accepted,
    /// Refused network access.
    Rejected,
}

impl DeviceStatus {
    pub const ALL: [DeviceStatus; 3] = [Self::Pending, Self::Accepted, Self::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// Apply an admission decision.
    ///
    /// Every decision is allowed from every state; applying a decision whose
    /// target is the current state leaves it unchanged.
    #[must_use]
    pub fn apply(self, admission: Admission) -> DeviceStatus {
        admission.target()
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for DeviceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// An administrative admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accept,
    Reject,
}

impl Admission {
    /// Status a device ends up in after this decision.
    pub fn target(self) -> DeviceStatus {
        match self {
            Self::Accept => DeviceStatus::Accepted,
            Self::Reject => DeviceStatus::Rejected,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Rejection reasons for a malformed admission request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// Identity is empty or whitespace.
    #[error("device identity is required")]
    MissingIdentity,

    /// Key is empty or whitespace.
    #[error("device key is required")]
    MissingKey,

    /// A field contains an embedded NUL character.
    #[error("{field} must not contain NUL characters")]
    ContainsNul { field: &'static str },

    /// An attribute has an empty name.
    #[error("attribute names must not be empty")]
    EmptyAttributeName,
}

/// Check the fields of an admission request before anything is derived or stored.
pub fn validate_submission(
    identity: &str,
    key: &str,
    attributes: &DeviceAttributes,
) -> Result<(), ValidationError> {
    if identity.trim().is_empty() {
        return Err(ValidationError::MissingIdentity);
    }
    if key.trim().is_empty() {
        return Err(ValidationError::MissingKey);
    }
    if identity.contains('\0') {
        return Err(ValidationError::ContainsNul { field: "identity" });
    }
    if key.contains('\0') {
        return Err(ValidationError::ContainsNul { field: "key" });
    }
    if attributes.keys().any(|name| name.trim().is_empty()) {
        return Err(ValidationError::EmptyAttributeName);
    }
    Ok(())
}

// ============================================================================
// Device
// ============================================================================

/// A device that has requested network admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Primary key, derived from (`device_identity`, `key`). Immutable.
    pub id: AuthId,

    /// Authentication public key claimed by the device.
    pub key: String,

    /// Identity data supplied by the device.
    pub device_identity: String,

    pub status: DeviceStatus,

    /// Time of the most recent admission request.
    pub request_time: DateTime<Utc>,

    pub attributes: DeviceAttributes,

    /// Absent on records written before schema 1.1.0 until backfilled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

impl Device {
    /// Create a new Pending device for a first admission request.
    pub fn new_pending(
        identity: impl Into<String>,
        key: impl Into<String>,
        attributes: DeviceAttributes,
        request_time: DateTime<Utc>,
    ) -> Self {
        let device_identity = identity.into();
        let key = key.into();
        Self {
            id: AuthId::derive(&device_identity, &key),
            key,
            device_identity,
            status: DeviceStatus::Pending,
            request_time,
            attributes,
            device_id: Some(DeviceId::generate()),
        }
    }

    /// Returns true if this record was created for exactly these credentials.
    pub fn matches_credentials(&self, identity: &str, key: &str) -> bool {
        self.device_identity == identity && self.key == key
    }

    /// Apply an admission decision to this record.
    pub fn admit(&mut self, admission: Admission) {
        self.status = self.status.apply(admission);
    }
}
