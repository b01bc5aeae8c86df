use p256::ecdsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::EncodedPoint;
use rand::{CryptoRng, RngCore};

use super::CryptoError;

/// New P-256 key: (scalar bytes, x, y).
pub(crate) fn generate(rng: &mut (impl RngCore + CryptoRng)) -> (Vec<u8>, [u8; 32], [u8; 32]) {
    let signing_key = SigningKey::random(rng);
    let (x, y) = coordinates(signing_key.verifying_key());
    (signing_key.to_bytes().to_vec(), x, y)
}

/// Hedged ECDSA over a prehashed digest, DER-encoded.
pub(crate) fn sign(
    scalar: &[u8],
    digest: &[u8; 32],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<Vec<u8>, CryptoError> {
    let signing_key = SigningKey::from_slice(scalar).map_err(|_| CryptoError::InvalidKey)?;
    let signature: Signature = signing_key
        .sign_prehash_with_rng(rng, digest)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

pub(crate) fn verify(x: &[u8; 32], y: &[u8; 32], digest: &[u8; 32], der: &[u8]) -> bool {
    let Some(key) = verifying_key(x, y) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(der) else {
        return false;
    };
    key.verify_prehash(digest, &signature).is_ok()
}

/// DER-encode a raw `r || s` signature as returned by a secure element.
pub fn der_from_raw(raw: &[u8; 64]) -> Result<Vec<u8>, CryptoError> {
    let signature =
        Signature::from_slice(raw).map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Split an uncompressed 64-byte `x || y` point into coordinates after checking it is on the curve.
pub fn split_point(raw: &[u8; 64]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(&raw[..32]);
    y.copy_from_slice(&raw[32..]);
    verifying_key(&x, &y).ok_or(CryptoError::InvalidPublicKey)?;
    Ok((x, y))
}

fn verifying_key(x: &[u8; 32], y: &[u8; 32]) -> Option<VerifyingKey> {
    let point = EncodedPoint::from_affine_coordinates(x.into(), y.into(), false);
    VerifyingKey::from_encoded_point(&point).ok()
}

pub(crate) fn coordinates(key: &VerifyingKey) -> ([u8; 32], [u8; 32]) {
    let point = key.to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    // Uncompressed points always carry both coordinates.
    if let (Some(px), Some(py)) = (point.x(), point.y()) {
        x.copy_from_slice(px);
        y.copy_from_slice(py);
    }
    (x, y)
}
