//! Appliance version strings.
//!
//! Versions are dotted numeric strings (`5.8.0.17`) plus the special
//! `master` stream, which sorts above every numbered release.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Version label of the development stream.
pub const LATEST: &str = "master";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Version {
    raw: String,
    parts: Vec<u64>,
    latest: bool,
}

impl Version {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let latest = raw == LATEST;
        // Non-numeric suffixes like "5.9.0.3-beta1" stop the numeric prefix.
        let parts = if latest {
            Vec::new()
        } else {
            raw.split(['.', '-', '_'])
                .map_while(|p| p.parse::<u64>().ok())
                .collect()
        };
        Self { raw, parts, latest }
    }

    pub fn latest() -> Self {
        Self::parse(LATEST)
    }

    pub fn is_latest(&self) -> bool {
        self.latest
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `self >= other`, with `other` given as a version string.
    pub fn at_least(&self, other: &str) -> bool {
        *self >= Version::parse(other)
    }

    /// `self < other`, with `other` given as a version string.
    pub fn below(&self, other: &str) -> bool {
        *self < Version::parse(other)
    }

    /// Major.minor series, e.g. `5.8` for `5.8.0.17`.
    pub fn series(&self) -> String {
        if self.latest {
            return LATEST.to_string();
        }
        self.parts
            .iter()
            .take(2)
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl From<String> for Version {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.latest, other.latest) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let len = self.parts.len().max(other.parts.len());
                for i in 0..len {
                    let a = self.parts.get(i).copied().unwrap_or(0);
                    let b = other.parts.get(i).copied().unwrap_or(0);
                    match a.cmp(&b) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                Ordering::Equal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ordering() {
        assert!(Version::parse("5.8.0.17") > Version::parse("5.7.3"));
        assert!(Version::parse("5.10") > Version::parse("5.9.4"));
        assert_eq!(Version::parse("5.8"), Version::parse("5.8.0.0"));
    }

    #[test]
    fn test_latest_sorts_last() {
        let master = Version::latest();
        assert!(master.is_latest());
        assert!(master > Version::parse("99.0"));
        assert!(master.at_least("5.8"));
    }

    #[test]
    fn test_helpers() {
        let v = Version::parse("5.6.2.1");
        assert!(v.below("5.6.3"));
        assert!(!v.at_least("5.7"));
        assert_eq!(v.series(), "5.6");
        assert_eq!(Version::parse("5.9.0.3-beta1").series(), "5.9");
    }
}
