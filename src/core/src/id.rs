//! Composite identity of a built image resource.
//!
//! A built image is addressed by the remote it lives on and its content
//! fingerprint, serialized as `<remote>/<fingerprint>`.

use std::fmt;
use std::str::FromStr;

use crate::error::{BakeError, Result};

/// Durable handle of a built image: `(remote, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuiltImageId {
    remote: String,
    fingerprint: String,
}

impl BuiltImageId {
    pub fn new(remote: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Parse a `<remote>/<fingerprint>` string.
    ///
    /// Splits on the first `/`. The remote may be empty (default remote),
    /// the fingerprint may not.
    pub fn parse(id: &str) -> Result<Self> {
        let (remote, fingerprint) = id
            .split_once('/')
            .ok_or_else(|| BakeError::InvalidId(format!("'{id}': expected <remote>/<fingerprint>")))?;

        if fingerprint.is_empty() {
            return Err(BakeError::InvalidId(format!("'{id}': empty fingerprint")));
        }

        Ok(Self::new(remote, fingerprint))
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for BuiltImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.fingerprint)
    }
}

impl FromStr for BuiltImageId {
    type Err = BakeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
