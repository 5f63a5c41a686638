use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// 32-byte identifier for subnets, blockchains, assets and transactions.
/// Rendered as lowercase hex on the wire and in file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 32]);

impl Id {
    /// The empty id denotes the primary network.
    pub const EMPTY: Id = Id([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Id::EMPTY
    }

    /// Derive an id by hashing arbitrary bytes. Used for tx ids produced
    /// locally in tests.
    pub fn from_hash_of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Id(out)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::Validation(format!("invalid id {:?}: {}", s, e)))?;
        if bytes.len() != 32 {
            return Err(Error::Validation(format!(
                "invalid id {:?}: expected 32 bytes, got {}",
                s,
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Node identifier derived from the staking certificate: `NodeID-` followed
/// by the hex of the first 20 bytes of SHA-256 over the certificate DER.
/// Stable across restarts because the certificate is stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

const NODE_ID_PREFIX: &str = "NodeID-";

impl NodeId {
    pub fn from_cert_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        NodeId(format!("{}{}", NODE_ID_PREFIX, hex::encode(&digest[..20])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with(NODE_ID_PREFIX) {
            return Err(Error::Validation(format!("invalid node id {:?}", s)));
        }
        Ok(NodeId(s.to_string()))
    }
}

/// Derive a VM id from a VM name: the ASCII bytes right-padded with zeros to
/// 32 bytes. Deterministic, and injective for names that differ ignoring
/// trailing zero bytes. Names longer than 32 bytes are rejected.
pub fn vm_id(vm_name: &str) -> Result<Id> {
    let name = vm_name.as_bytes();
    if name.len() > 32 {
        return Err(Error::Validation(format!(
            "VM name must be <= 32 bytes, found {}",
            name.len()
        )));
    }
    let mut out = [0u8; 32];
    out[..name.len()].copy_from_slice(name);
    Ok(Id(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_deterministic() {
        let a = vm_id("subnetevm").unwrap();
        let b = vm_id("subnetevm").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_vm_id_distinct_names() {
        let a = vm_id("subnetevm").unwrap();
        let b = vm_id("timestampvm").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_vm_id_too_long() {
        let name = "x".repeat(33);
        assert!(vm_id(&name).is_err());
        // 32 bytes exactly is fine
        assert!(vm_id(&"x".repeat(32)).is_ok());
    }

    #[test]
    fn test_id_hex_round_trip() {
        let id = vm_id("subnetevm").unwrap();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_rejects_bad_hex() {
        assert!("zz".parse::<Id>().is_err());
        assert!("abcd".parse::<Id>().is_err());
    }

    #[test]
    fn test_node_id_stable() {
        let der = b"certificate bytes";
        let a = NodeId::from_cert_der(der);
        let b = NodeId::from_cert_der(der);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("NodeID-"));
    }
}
