//! Client protocol versions
//!
//! Clients are identified by a date-coded version number (YYYYMMDD). Packet
//! layouts are keyed by half-open version ranges.

use std::fmt;

/// Date-coded client protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketVersion(pub u32);

/// Oldest client whose unit appearance packets are in the layout table
pub const MIN_SUPPORTED_VERSION: PacketVersion = PacketVersion(20080102);

impl fmt::Display for PacketVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PacketVersion {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Half-open range `[since, until)` of protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub since: u32,
    pub until: u32,
}

impl VersionRange {
    /// Every version
    pub const ALL: Self = Self {
        since: 0,
        until: u32::MAX,
    };

    /// Versions at or after `since`
    pub const fn from(since: u32) -> Self {
        Self {
            since,
            until: u32::MAX,
        }
    }

    /// Versions strictly before `until`
    pub const fn before(until: u32) -> Self {
        Self { since: 0, until }
    }

    pub const fn between(since: u32, until: u32) -> Self {
        Self { since, until }
    }

    pub fn contains(&self, version: PacketVersion) -> bool {
        version.0 >= self.since && version.0 < self.until
    }
}
