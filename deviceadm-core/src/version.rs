//! Schema version markers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Semantic version describing which migrations have been applied to the
/// device registry.
///
/// Ordering compares major, then minor, then patch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    /// No migrations applied.
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error returned for a version string that is not `MAJOR.MINOR.PATCH`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schema version {0:?}: expected MAJOR.MINOR.PATCH")]
pub struct ParseVersionError(pub String);

impl FromStr for SchemaVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());

        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ParseVersionError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let version = SchemaVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let v = SchemaVersion::new(1, 10, 3);
        assert_eq!(v.to_string(), "1.10.3");
        assert_eq!("1.10.3".parse::<SchemaVersion>(), Ok(v));
        assert_eq!("0.0.0".parse::<SchemaVersion>(), Ok(SchemaVersion::ZERO));
    }

    #[test]
    fn parse_rejects_malformed() {
        for input in ["", "1", "1.2", "1.2.3.4", "1.x.0", "-1.0.0", "1..0", "v1.0.0", "+1.0.0"] {
            assert!(
                input.parse::<SchemaVersion>().is_err(),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        assert!(SchemaVersion::new(1, 10, 0) > SchemaVersion::new(1, 9, 0));
        assert!(SchemaVersion::new(2, 0, 0) > SchemaVersion::new(1, 99, 99));
        assert!(SchemaVersion::new(0, 1, 0) > SchemaVersion::ZERO);
        assert_eq!(SchemaVersion::default(), SchemaVersion::ZERO);
    }
}
