//! Verification of the `manifest.sig` section. Keys are PEM-encoded
//! SubjectPublicKeyInfo blocks (RSA or ECDSA P-256); the signature is
//! computed over the raw manifest bytes. Keys are tried in configuration
//! order until one verifies; errors report how many keys were tried and
//! never include key material.

use crate::error::{self, Result};
use ring::signature::{self, UnparsedPublicKey};
use snafu::ensure;

// Algorithm OIDs from the SubjectPublicKeyInfo header.
const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
const OID_EC_PUBLIC_KEY: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Rsa,
    EcdsaP256,
}

/// One configured verification key, ready for use.
#[derive(Debug, Clone)]
pub struct VerifyKey {
    kind: KeyKind,
    // For RSA: the PKCS#1 RSAPublicKey DER. For ECDSA: the uncompressed
    // curve point. Both exactly what ring's UnparsedPublicKey expects.
    key_bytes: Vec<u8>,
}

impl VerifyKey {
    /// Parses a PEM "PUBLIC KEY" block.
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(pem_data);
        let block = pem::parse(text.as_ref()).map_err(|e| {
            error::KeyParseSnafu {
                reason: e.to_string(),
            }
            .build()
        })?;
        ensure!(
            block.tag == "PUBLIC KEY",
            error::KeyParseSnafu {
                reason: format!("unexpected PEM tag '{}'", block.tag),
            }
        );
        Self::from_spki_der(&block.contents)
    }

    fn from_spki_der(der: &[u8]) -> Result<Self> {
        let (alg_oid, key_bytes) = parse_spki(der).ok_or_else(|| {
            error::KeyParseSnafu {
                reason: "malformed SubjectPublicKeyInfo".to_string(),
            }
            .build()
        })?;

        let kind = if alg_oid == OID_RSA_ENCRYPTION {
            KeyKind::Rsa
        } else if alg_oid == OID_EC_PUBLIC_KEY {
            KeyKind::EcdsaP256
        } else {
            return error::KeyParseSnafu {
                reason: "unsupported public key algorithm".to_string(),
            }
            .fail();
        };

        Ok(Self {
            kind,
            key_bytes: key_bytes.to_vec(),
        })
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self.kind {
            KeyKind::Rsa => {
                UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, &self.key_bytes)
                    .verify(message, signature)
                    .is_ok()
            }
            KeyKind::EcdsaP256 => {
                UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &self.key_bytes)
                    .verify(message, signature)
                    .is_ok()
            }
        }
    }
}

/// Verifies `signature` over `message` (the raw manifest bytes) against the
/// configured keys, in order, short-circuiting on the first success.
pub fn verify_signature(message: &[u8], signature: &[u8], keys: &[VerifyKey]) -> Result<()> {
    ensure!(
        keys.iter().any(|key| key.verify(message, signature)),
        error::SignatureVerificationSnafu {
            keys_tried: keys.len(),
        }
    );
    Ok(())
}

/// Minimal DER walk over SubjectPublicKeyInfo:
/// SEQUENCE { SEQUENCE { OID, params... }, BIT STRING { 0x00, key } }
/// Returns (algorithm OID bytes, key bytes).
fn parse_spki(der: &[u8]) -> Option<(&[u8], &[u8])> {
    let (outer, rest) = read_tlv(der, 0x30)?;
    if !rest.is_empty() {
        return None;
    }
    let (alg_seq, after_alg) = read_tlv(outer, 0x30)?;
    let (oid, _params) = read_tlv(alg_seq, 0x06)?;
    let (bit_string, trailing) = read_tlv(after_alg, 0x03)?;
    if !trailing.is_empty() {
        return None;
    }
    // The first bit-string byte counts unused bits; zero for keys.
    match bit_string.split_first() {
        Some((0x00, key)) => Some((oid, key)),
        _ => None,
    }
}

/// Reads one DER TLV with the given tag, returning (value, remainder).
fn read_tlv(data: &[u8], tag: u8) -> Option<(&[u8], &[u8])> {
    let (&t, rest) = data.split_first()?;
    if t != tag {
        return None;
    }
    let (&first_len, rest) = rest.split_first()?;
    let (len, rest) = if first_len & 0x80 == 0 {
        (first_len as usize, rest)
    } else {
        let num_bytes = (first_len & 0x7f) as usize;
        if num_bytes == 0 || num_bytes > 4 || rest.len() < num_bytes {
            return None;
        }
        let mut len = 0usize;
        for &b in &rest[..num_bytes] {
            len = (len << 8) | b as usize;
        }
        (len, &rest[num_bytes..])
    };
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}
