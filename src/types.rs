//! Core value types shared across the cache, router, and proxy layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a model artifact: an opaque `(name, version)` string pair.
///
/// Equality is byte-exact; the cache never parses either component. The
/// proxy edge guarantees `version` is non-empty before a key reaches the
/// core (the gRPC surface synthesizes `"0"` for an absent numeric version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub name: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Relative path of this model under a model directory: `{name}/{version}`.
    pub fn rel_path(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
