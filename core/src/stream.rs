//! Stream identity and version types.
//!
//! An event stream is the ordered sequence of events for one aggregate; it is
//! named by a [`StreamId`] and its length is tracked as a [`Version`]. These
//! newtypes keep stream names and version numbers from being confused with
//! arbitrary strings and integers in signatures across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for [`StreamId`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid stream id: {0}")]
pub struct ParseStreamIdError(String);

/// Name of an event stream: the aggregate id.
///
/// Examples: `"account-7"`, `"order-3f2a"`. One aggregate instance owns
/// exactly one stream; the store offers no ordering between distinct streams.
///
/// # Validation
///
/// - `FromStr` rejects empty input (use it for external data).
/// - [`StreamId::new`] and the `From` impls accept anything (trusted,
///   application-generated ids).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream id from a trusted string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// View the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id, returning the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("stream id cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stream version: the number of events stored in (or applied to) a stream.
///
/// A new stream is at version 0. After `n` appended events the stream is at
/// version `n`, and those events occupy positions `0..n`. Appending with an
/// expected version asserts the stream's current count:
///
/// - expected matches: the append succeeds and the version advances
/// - expected differs: the append fails with a concurrency conflict and the
///   caller reloads and retries
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of an empty stream.
    pub const INITIAL: Self = Self(0);

    /// Create a version with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version after one more event.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the version of an empty stream.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for Version {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_roundtrip() {
        let id = StreamId::new("account-7");
        assert_eq!(id.as_str(), "account-7");
        assert_eq!(format!("{id}"), "account-7");
        assert_eq!(id.into_inner(), "account-7");
    }

    #[test]
    fn stream_id_parse_rejects_empty() {
        assert!("".parse::<StreamId>().is_err());
        assert!("account-7".parse::<StreamId>().is_ok());
    }

    #[test]
    fn version_counts_events() {
        let empty = Version::INITIAL;
        assert!(empty.is_initial());

        let after_three = empty.next().next().next();
        assert_eq!(after_three, Version::new(3));
        assert_eq!(after_three.value(), 3);
    }

    #[test]
    fn version_arithmetic_and_ordering() {
        let v5 = Version::new(5);
        assert_eq!(v5 + 2, Version::new(7));
        assert_eq!(v5 - 3, Version::new(2));
        assert!(Version::new(4) < v5);
    }

    #[test]
    fn version_conversions() {
        let version = Version::from(9_u64);
        let raw: u64 = version.into();
        assert_eq!(raw, 9);
    }
}
