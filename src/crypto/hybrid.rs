//! ES256 + ML-DSA-44 composite signatures.
//!
//! Wire form: `u16_be(len(der)) || der || mldsa_sig`.

use super::{ecdsa, mldsa, Algorithm};

pub(crate) fn combine(der: &[u8], pqc: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + der.len() + pqc.len());
    out.extend_from_slice(&(der.len() as u16).to_be_bytes());
    out.extend_from_slice(der);
    out.extend_from_slice(pqc);
    out
}

/// Split a composite signature into its ECDSA (DER) and ML-DSA halves.
pub fn split(signature: &[u8]) -> Option<(&[u8], &[u8])> {
    let len_bytes: [u8; 2] = signature.get(..2)?.try_into().ok()?;
    let der_len = u16::from_be_bytes(len_bytes) as usize;
    let der = signature.get(2..2 + der_len)?;
    let pqc = signature.get(2 + der_len..)?;
    if pqc.is_empty() {
        return None;
    }
    Some((der, pqc))
}

pub(crate) fn verify(x: &[u8; 32], y: &[u8; 32], pqc_public: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
    let Some((der, pqc)) = split(signature) else {
        return false;
    };
    ecdsa::verify(x, y, digest, der) && mldsa::verify(Algorithm::MlDsa44, pqc_public, digest, pqc)
}
