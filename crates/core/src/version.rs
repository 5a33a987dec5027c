//! Stream version: the optimistic-concurrency token.

use serde::{Deserialize, Serialize};

/// Number of events an aggregate has absorbed.
///
/// `Version::INITIAL` (zero) means the aggregate does not exist yet. Every
/// appended event moves the version forward by exactly one.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether at least one event has been applied.
    pub const fn exists(self) -> bool {
        self.0 > 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Version after `count` more events.
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Number of events between `earlier` and `self` (saturating).
    pub const fn since(self, earlier: Version) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(value: Version) -> Self {
        value.0
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn initial_version_does_not_exist() {
        assert!(!Version::INITIAL.exists());
        assert!(Version::INITIAL.next().exists());
    }

    proptest! {
        #[test]
        fn advance_matches_repeated_next(start in 0u64..1_000_000, count in 0u64..64) {
            let mut v = Version::new(start);
            for _ in 0..count {
                v = v.next();
            }
            prop_assert_eq!(v, Version::new(start).advance(count));
            prop_assert_eq!(v.since(Version::new(start)), count);
        }
    }
}
