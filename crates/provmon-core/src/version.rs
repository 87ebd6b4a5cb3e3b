//! Peer protocol versions.
//!
//! Monitors advertise a protocol version such as `"1.0"` or
//! `"2.1-SNAPSHOT"`. Short forms are padded to three components and then
//! handed to `semver`, so `"2"` and `"2.0.0"` compare equal.

use std::fmt;

use thiserror::Error;

/// Protocol version advertised by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,

    #[error("too many version components in {0:?}")]
    TooManyComponents(String),

    #[error("invalid version {input:?}: {reason}")]
    Invalid { input: String, reason: String },
}

/// A parsed peer protocol version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(semver::Version);

impl ProtocolVersion {
    /// Parse a dotted version with an optional `-TAG` suffix.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(VersionError::Empty);
        }

        let (core, tag) = match input.split_once('-') {
            Some((core, tag)) => (core, Some(tag)),
            None => (input, None),
        };

        let mut parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(VersionError::TooManyComponents(input.to_string()));
        }
        while parts.len() < 3 {
            parts.push("0");
        }

        let mut normalized = parts.join(".");
        if let Some(tag) = tag {
            normalized.push('-');
            normalized.push_str(tag);
        }

        semver::Version::parse(&normalized)
            .map(Self)
            .map_err(|e| VersionError::Invalid {
                input: input.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    /// Whether this is a pre-release (`-SNAPSHOT`) build.
    pub fn is_snapshot(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// A peer is compatible when its major version is at least `min_major`.
    pub fn is_supported(&self, min_major: u64) -> bool {
        self.0.major >= min_major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
