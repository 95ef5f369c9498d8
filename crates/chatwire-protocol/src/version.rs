//! Protocol version spoken on the wire.
//!
//! A client sends only its major version in `connect`. Minor bumps add
//! optional fields, so any client with the same major is served.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The version this build speaks.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Two versions interoperate when their majors match.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Whether a `connect` announcing `major` is accepted.
    #[must_use]
    pub fn accepts_major(&self, major: u8) -> bool {
        self.major == major
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
