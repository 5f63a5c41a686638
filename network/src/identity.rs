use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};
use crate::ids::NodeId;

/// Validity of generated staking certificates. Long-lived on purpose: the
/// certificate is the node's identity and must survive every restart.
const CERT_VALIDITY_DAYS: i64 = 365 * 100;

const BLS_KEY_LEN: usize = 32;

/// A node's staking material: TLS certificate and key (PEM), BLS signing key
/// (base64) and the node id derived from the certificate.
#[derive(Debug, Clone)]
pub struct StakingIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub bls_signing_key: String,
    pub node_id: NodeId,
}

impl StakingIdentity {
    /// Generate a fresh self-signed identity.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Resource(format!("failed to generate staking key pair: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "netrunner staking");
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = OffsetDateTime::now_utc() + Duration::days(CERT_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Resource(format!("failed to self-sign staking cert: {}", e)))?;

        let node_id = NodeId::from_cert_der(cert.der());

        let mut bls_key = [0u8; BLS_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bls_key);

        Ok(StakingIdentity {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            bls_signing_key: BASE64.encode(bls_key),
            node_id,
        })
    }

    /// Reinstall previously saved material, re-deriving the same node id.
    pub fn from_material(cert_pem: &str, key_pem: &str, bls_signing_key: &str) -> Result<Self> {
        let node_id = node_id_from_cert_pem(cert_pem)?;
        BASE64
            .decode(bls_signing_key)
            .map_err(|e| Error::Validation(format!("invalid BLS signing key: {}", e)))?;
        Ok(StakingIdentity {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            bls_signing_key: bls_signing_key.to_string(),
            node_id,
        })
    }
}

/// Derive the node id from a PEM-encoded staking certificate.
pub fn node_id_from_cert_pem(cert_pem: &str) -> Result<NodeId> {
    let mut reader = Cursor::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::Validation("no certificate in staking cert PEM".into()))?
        .map_err(|e| Error::Validation(format!("failed to parse staking cert: {}", e)))?;
    Ok(NodeId::from_cert_der(&der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct_identities() {
        let a = StakingIdentity::generate().unwrap();
        let b = StakingIdentity::generate().unwrap();
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn test_node_id_stable_across_reload() {
        let generated = StakingIdentity::generate().unwrap();
        let reloaded = StakingIdentity::from_material(
            &generated.cert_pem,
            &generated.key_pem,
            &generated.bls_signing_key,
        )
        .unwrap();
        assert_eq!(generated.node_id, reloaded.node_id);
    }

    #[test]
    fn test_rejects_bad_bls_key() {
        let generated = StakingIdentity::generate().unwrap();
        let result =
            StakingIdentity::from_material(&generated.cert_pem, &generated.key_pem, "not base64!");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_garbage_cert() {
        assert!(node_id_from_cert_pem("garbage").is_err());
    }
}
