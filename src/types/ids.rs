//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl TryFrom<String> for $name {
            type Error = &'static str;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_string(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl $name {
            pub fn from_string(s: impl Into<String>) -> Result<Self, &'static str> {
                let s = s.into();
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(NodeId, uuid);
define_id!(CorrelationId, uuid);
define_id!(Digest);

impl Digest {
    /// Content digest of a function's source: lowercase SHA-256 hex.
    pub fn of(source: &[u8]) -> Self {
        let hash = Sha256::digest(source);
        let mut hex = String::with_capacity(hash.len() * 2);
        for byte in hash {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ids_rejected() {
        assert!(NodeId::from_string("").is_err());
        assert!(Digest::from_string(String::new()).is_err());
        assert_eq!(Digest::from_string("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_digest_of_is_sha256_hex() {
        let digest = Digest::of(b"abc");
        assert_eq!(
            digest.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(Digest::of(b"abc"), digest);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let digest = Digest::from_string("d1").unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), "\"d1\"");
        let back: Digest = serde_json::from_str("\"d1\"").unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_empty_ids_rejected_on_deserialize() {
        let err = serde_json::from_str::<Digest>("\"\"").unwrap_err();
        assert!(err.to_string().contains("Digest cannot be empty"), "{}", err);
        assert!(serde_json::from_str::<NodeId>("\"\"").is_err());
        assert!(serde_json::from_str::<CorrelationId>("\"\"").is_err());
    }
}
