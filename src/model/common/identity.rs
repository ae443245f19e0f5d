use std::fmt::{Display, Formatter};

use data_encoding::HEXLOWER;
use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of an [`IdentityHash`] in characters.
pub const IDENTITY_HASH_LEN: usize = 64;

/// A participant's raw national identity, as submitted by the client.
/// Never stored, never logged; only its hash leaves the request handler.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity(String);

impl Identity {
    /// Validate a raw identity. Missing or empty values are rejected.
    pub fn parse(raw: Option<String>) -> Result<Self> {
        match raw {
            Some(raw) if !raw.is_empty() => Ok(Self(raw)),
            _ => Err(Error::BadRequest("Identity is required".to_string())),
        }
    }

    /// The one-way storage key for this identity.
    pub fn hash(&self) -> IdentityHash {
        IdentityHash::of(self)
    }
}

// Keep the raw value out of debug output.
impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Identity(..)")
    }
}

/// Hex-encoded SHA-256 digest of an [`Identity`]: the key participants are stored under.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityHash(String);

impl IdentityHash {
    /// Hash the given identity.
    pub fn of(identity: &Identity) -> Self {
        let digest = Sha256::digest(identity.0.as_bytes());
        Self(HEXLOWER.encode(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short prefix, enough to correlate log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl Display for IdentityHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&IdentityHash> for Bson {
    fn from(hash: &IdentityHash) -> Self {
        Bson::String(hash.0.clone())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_fixed_length() {
        let first = Identity::example().hash();
        let second = Identity::example().hash();
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), IDENTITY_HASH_LEN);
        assert_eq!(Identity::example_n(1).hash().as_str().len(), IDENTITY_HASH_LEN);
    }

    #[test]
    fn hash_matches_sha256_hex() {
        let identity = Identity::parse(Some("abc".to_string())).unwrap();
        assert_eq!(
            identity.hash().as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn distinct_identities_hash_differently() {
        assert_ne!(Identity::example().hash(), Identity::example2().hash());
    }

    #[test]
    fn empty_or_missing_identity_rejected() {
        assert!(matches!(Identity::parse(None), Err(Error::BadRequest(_))));
        assert!(matches!(
            Identity::parse(Some(String::new())),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn debug_hides_raw_identity() {
        let debug = format!("{:?}", Identity::example());
        assert!(!debug.contains(Identity::example().raw()));
    }
}
