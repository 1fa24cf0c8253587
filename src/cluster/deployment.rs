//! Deployment record handed to `onDeploy` handlers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::Digest;

/// A function's source plus the metadata deploy-time hooks inspect
/// (signature verification, dependency resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub digest: Digest,
    pub source: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Package name → version requirement.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl Deployment {
    /// A deployment keyed by the SHA-256 digest of `source`.
    pub fn new(source: impl Into<Bytes>) -> Self {
        let source = source.into();
        Self::with_digest(Digest::of(&source), source)
    }

    /// A deployment under a caller-chosen digest.
    pub fn with_digest(digest: Digest, source: impl Into<Bytes>) -> Self {
        Self {
            digest,
            source: source.into(),
            identity: None,
            signature: None,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_content_derived() {
        let a = Deployment::new("module.exports = x => x");
        let b = Deployment::new("module.exports = x => x");
        let c = Deployment::new("module.exports = () => 1");
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a.digest.as_str().len(), 64);
    }

    #[test]
    fn test_builder_metadata() {
        let d = Deployment::with_digest(Digest::from_string("d1").unwrap(), "src")
            .identity("alice")
            .signature("sig")
            .dependency("left-pad", "^1.3");
        assert_eq!(d.identity.as_deref(), Some("alice"));
        assert_eq!(d.dependencies.get("left-pad").map(String::as_str), Some("^1.3"));
    }
}
