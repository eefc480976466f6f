//! DNSSEC key signing key of the zone
//!
//! One ECDSAP256SHA256 KSK per zone. CoreDNS reads it from BIND-style
//! `.key`/`.private` files and signs on the fly; the DS record is what the
//! parent zone has to publish.

use std::fmt::Write as _;
use std::path::Path;

use aws_lc_rs::digest::{digest, SHA256};
use aws_lc_rs::encoding::AsBigEndian;
use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::zone::{fqdn, DEFAULT_ZONE_TTL};

/// File the key is persisted in, relative to the root directory
pub const KEY_FILE: &str = "dns-sec-key.json";

const FLAGS_KSK: u16 = 257;
const PROTOCOL: u8 = 3;
const ALGORITHM_ECDSAP256SHA256: u8 = 13;
const DIGEST_SHA256: u8 = 2;

/// Persisted key material, all in presentation format
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSecKey {
    /// `K<zone>.+013+<tag>`, the CoreDNS key file basename
    pub basename: String,
    /// DNSKEY record
    pub key: String,
    /// BIND private key file
    pub private: String,
    /// DS record for the parent zone
    pub ds: String,
}

impl DnsSecKey {
    /// Generate a fresh key for `zone`
    pub fn generate(zone: &str) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::Crypto("ECDSA P-256 generation failed".into()))?;
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref())
            .map_err(|_| Error::Crypto("generated PKCS#8 document is unreadable".into()))?;
        let scalar = pair
            .private_key()
            .as_be_bytes()
            .map_err(|_| Error::Crypto("private scalar is not exportable".into()))?;

        // Uncompressed point is 0x04 | X | Y; DNSKEY carries X | Y
        let point = pair.public_key().as_ref();
        let public = point
            .get(1..)
            .ok_or_else(|| Error::Crypto("empty public key".into()))?;
        Ok(Self::from_parts(zone, public, scalar.as_ref()))
    }

    fn from_parts(zone: &str, public: &[u8], scalar: &[u8]) -> Self {
        let owner = fqdn(zone).to_ascii_lowercase();
        let rdata = dnskey_rdata(public);
        let tag = key_tag(&rdata);

        let key = format!(
            "{}\t{}\tIN\tDNSKEY\t{} {} {} {}",
            owner,
            DEFAULT_ZONE_TTL,
            FLAGS_KSK,
            PROTOCOL,
            ALGORITHM_ECDSAP256SHA256,
            STANDARD.encode(public)
        );
        let private = format!(
            "Private-key-format: v1.3\nAlgorithm: {} (ECDSAP256SHA256)\nPrivateKey: {}\n",
            ALGORITHM_ECDSAP256SHA256,
            STANDARD.encode(scalar)
        );

        let mut signed = wire_name(&owner);
        signed.extend_from_slice(&rdata);
        let ds = format!(
            "{}\t{}\tIN\tDS\t{} {} {} {}",
            owner,
            DEFAULT_ZONE_TTL,
            tag,
            ALGORITHM_ECDSAP256SHA256,
            DIGEST_SHA256,
            upper_hex(digest(&SHA256, &signed).as_ref())
        );
        Self {
            basename: format!("K{}+{:03}+{:05}", owner, ALGORITHM_ECDSAP256SHA256, tag),
            key,
            private,
            ds,
        }
    }

    /// Load the key from `root`, generating and persisting one when absent
    pub fn load_or_generate(root: &Path, zone: &str) -> Result<Self> {
        let path = root.join(KEY_FILE);
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&data)?);
        }
        let key = Self::generate(zone)?;
        std::fs::write(&path, serde_json::to_string_pretty(&key)?)?;
        info!(basename = %key.basename, "Generated DNSSEC key");
        Ok(key)
    }

    /// Write the `.key` and `.private` files CoreDNS loads
    pub fn write_key_files(&self, root: &Path) -> Result<()> {
        std::fs::write(root.join(format!("{}.key", self.basename)), format!("{}\n", self.key))?;
        std::fs::write(root.join(format!("{}.private", self.basename)), &self.private)?;
        Ok(())
    }
}

fn dnskey_rdata(public: &[u8]) -> Vec<u8> {
    let mut rdata = Vec::with_capacity(4 + public.len());
    rdata.extend_from_slice(&FLAGS_KSK.to_be_bytes());
    rdata.push(PROTOCOL);
    rdata.push(ALGORITHM_ECDSAP256SHA256);
    rdata.extend_from_slice(public);
    rdata
}

/// RFC 4034 Appendix B
fn key_tag(rdata: &[u8]) -> u16 {
    let mut ac: u32 = 0;
    for (i, b) in rdata.iter().enumerate() {
        if i & 1 == 1 {
            ac += u32::from(*b);
        } else {
            ac += u32::from(*b) << 8;
        }
    }
    ac += (ac >> 16) & 0xffff;
    (ac & 0xffff) as u16
}

/// Uncompressed wire encoding of an absolute name
fn wire_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 1);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

fn upper_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02X}", b);
        s
    })
}
