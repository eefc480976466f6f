//! SSH key material
//!
//! Apps and controllers get ECDSA P-256 key pairs: the public half in
//! OpenSSH `authorized_keys` format, the private half as a PKCS#8 PEM
//! document (accepted by OpenSSH, soft-serve and git2 alike).

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

/// A generated SSH key pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// `ecdsa-sha2-nistp256 AAAA...`
    pub public: String,
    /// PKCS#8 PEM private key
    pub private: String,
}

impl SshKeyPair {
    /// Generate a fresh ECDSA P-256 key pair
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::key_generation("ECDSA P-256 generation failed"))?;
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref())
            .map_err(|_| Error::key_generation("generated PKCS#8 document is unreadable"))?;

        let public = openssh_public_key(pair.public_key().as_ref());
        let private = pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8.as_ref().to_vec()));
        Ok(Self { public, private })
    }
}

/// Encode an uncompressed P-256 point as an OpenSSH public key line
pub fn openssh_public_key(point: &[u8]) -> String {
    let mut blob = Vec::with_capacity(point.len() + 64);
    put_ssh_string(&mut blob, SSH_KEY_TYPE.as_bytes());
    put_ssh_string(&mut blob, SSH_CURVE.as_bytes());
    put_ssh_string(&mut blob, point);
    format!("{} {}", SSH_KEY_TYPE, STANDARD.encode(blob))
}

fn put_ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_public_key_is_openssh_ecdsa() {
        let keys = SshKeyPair::generate().expect("key generation should succeed");
        let (kind, body) = keys
            .public
            .split_once(' ')
            .expect("public key has a type prefix");
        assert_eq!(kind, "ecdsa-sha2-nistp256");

        let blob = STANDARD.decode(body).expect("body is base64");
        // string "ecdsa-sha2-nistp256" | string "nistp256" | string point(65)
        assert_eq!(blob.len(), 4 + 19 + 4 + 8 + 4 + 65);
        assert_eq!(&blob[4..23], b"ecdsa-sha2-nistp256");
        assert_eq!(blob[35 + 4], 0x04);
    }

    #[test]
    fn private_key_is_pkcs8_pem() {
        let keys = SshKeyPair::generate().expect("key generation should succeed");
        let parsed = pem::parse(&keys.private).expect("private key is PEM");
        assert_eq!(parsed.tag(), "PRIVATE KEY");
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, parsed.contents())
            .expect("PEM body is a P-256 PKCS#8 document");
    }

    #[test]
    fn every_call_yields_new_keys() {
        let a = SshKeyPair::generate().expect("first");
        let b = SshKeyPair::generate().expect("second");
        assert_ne!(a.public, b.public);
    }
}
