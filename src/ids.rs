//! Opaque identifiers used throughout the daemon: bus IDs and client IDs.

use std::fmt;

/// A USB bus ID, e.g. `1-1` or `3-2.4`. Stable for the lifetime of a
/// physical cable path; not a GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BusId(String);

impl BusId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if `self` starts with any of the watched port prefixes.
    pub fn matches_any_prefix(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.0.starts_with(p.as_str()))
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BusId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A client identifier, lowercased hostname by convention. The sentinel
/// value `"none"` means "unassigned".
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub const NONE_STR: &'static str = "none";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn none() -> Self {
        Self(Self::NONE_STR.to_owned())
    }

    pub fn is_none(&self) -> bool {
        self.0 == Self::NONE_STR
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::none()
    }
}
