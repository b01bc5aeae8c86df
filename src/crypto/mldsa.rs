use fips204::traits::{SerDes, Signer, Verifier};
use fips204::{ml_dsa_44, ml_dsa_65};
use rand::{CryptoRng, RngCore};

use super::{Algorithm, CryptoError};

/// Empty signing context; credentials are bound to a single purpose.
const CONTEXT: &[u8] = &[];

/// New ML-DSA key pair: (private key bytes, public key bytes).
pub(crate) fn generate(
    algorithm: Algorithm,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    match algorithm {
        Algorithm::MlDsa44 => {
            let (pk, sk) = ml_dsa_44::try_keygen_with_rng(rng)
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
            Ok((sk.into_bytes().to_vec(), pk.into_bytes().to_vec()))
        }
        Algorithm::MlDsa65 => {
            let (pk, sk) = ml_dsa_65::try_keygen_with_rng(rng)
                .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
            Ok((sk.into_bytes().to_vec(), pk.into_bytes().to_vec()))
        }
        other => Err(CryptoError::KeyGeneration(format!("{other} is not an ML-DSA parameter set"))),
    }
}

pub(crate) fn sign(
    algorithm: Algorithm,
    private: &[u8],
    message: &[u8],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<Vec<u8>, CryptoError> {
    match algorithm {
        Algorithm::MlDsa44 => {
            let bytes: [u8; ml_dsa_44::SK_LEN] =
                private.try_into().map_err(|_| CryptoError::InvalidKey)?;
            let sk = ml_dsa_44::PrivateKey::try_from_bytes(bytes)
                .map_err(|_| CryptoError::InvalidKey)?;
            let sig = sk
                .try_sign_with_rng(rng, message, CONTEXT)
                .map_err(|e| CryptoError::Signing(e.to_string()))?;
            Ok(sig.to_vec())
        }
        Algorithm::MlDsa65 => {
            let bytes: [u8; ml_dsa_65::SK_LEN] =
                private.try_into().map_err(|_| CryptoError::InvalidKey)?;
            let sk = ml_dsa_65::PrivateKey::try_from_bytes(bytes)
                .map_err(|_| CryptoError::InvalidKey)?;
            let sig = sk
                .try_sign_with_rng(rng, message, CONTEXT)
                .map_err(|e| CryptoError::Signing(e.to_string()))?;
            Ok(sig.to_vec())
        }
        _ => Err(CryptoError::InvalidKey),
    }
}

pub(crate) fn verify(algorithm: Algorithm, public: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match algorithm {
        Algorithm::MlDsa44 => {
            let (Ok(pk), Ok(sig)) = (
                <[u8; ml_dsa_44::PK_LEN]>::try_from(public),
                <[u8; ml_dsa_44::SIG_LEN]>::try_from(signature),
            ) else {
                return false;
            };
            ml_dsa_44::PublicKey::try_from_bytes(pk)
                .map(|pk| pk.verify(message, &sig, CONTEXT))
                .unwrap_or(false)
        }
        Algorithm::MlDsa65 => {
            let (Ok(pk), Ok(sig)) = (
                <[u8; ml_dsa_65::PK_LEN]>::try_from(public),
                <[u8; ml_dsa_65::SIG_LEN]>::try_from(signature),
            ) else {
                return false;
            };
            ml_dsa_65::PublicKey::try_from_bytes(pk)
                .map(|pk| pk.verify(message, &sig, CONTEXT))
                .unwrap_or(false)
        }
        _ => false,
    }
}
