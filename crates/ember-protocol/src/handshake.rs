//! Plugin transport handshake.
//!
//! Host and plugin exchange a `hello` as the first frame in each direction:
//! a shared magic cookie proving both ends speak this protocol, and a
//! version for compatibility negotiation.

use serde::{Deserialize, Serialize};

/// Shared secret identifying the plugin protocol. Not a security boundary,
/// just a guard against wiring an arbitrary child process into the event
/// bus.
pub const MAGIC_COOKIE: &str = "c4b12696e1a54f78d1a2a7f3be1f7c6e8a90d4b35c27e80143f6d9ab52c0e471";

/// Current plugin protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Plugin protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Breaking changes increment this.
    pub major: u8,
    /// Backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible when they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// First frame on a plugin connection, both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub cookie: String,
    pub version: Version,
}

impl Hello {
    /// The hello this build sends.
    #[must_use]
    pub fn current() -> Self {
        Self {
            cookie: MAGIC_COOKIE.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Whether a peer's hello is acceptable.
    #[must_use]
    pub fn accepts(&self, peer: &Hello) -> bool {
        peer.cookie == MAGIC_COOKIE && self.version.is_compatible_with(&peer.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compatibility() {
        let v1_0 = Version::new(1, 0);
        let v1_1 = Version::new(1, 1);
        let v2_0 = Version::new(2, 0);

        assert!(v1_0.is_compatible_with(&v1_1));
        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v2_0));
    }

    #[test]
    fn hello_rejects_wrong_cookie() {
        let ours = Hello::current();
        assert!(ours.accepts(&Hello::current()));

        let stranger = Hello {
            cookie: "nope".into(),
            version: PROTOCOL_VERSION,
        };
        assert!(!ours.accepts(&stranger));
    }

    #[test]
    fn hello_rejects_incompatible_major() {
        let ours = Hello::current();
        let future = Hello {
            cookie: MAGIC_COOKIE.into(),
            version: Version::new(PROTOCOL_VERSION.major + 1, 0),
        };
        assert!(!ours.accepts(&future));
    }
}
