pub mod cose;
pub mod ecdsa;
pub mod hybrid;
pub mod mldsa;
pub mod pin_protocol;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key material")]
    InvalidKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("cipher: {0}")]
    Cipher(String),
}

/// Signature algorithms a credential can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Es256,
    MlDsa44,
    MlDsa65,
    /// ES256 and ML-DSA-44 over the same digest; both must verify.
    HybridEs256MlDsa44,
}

impl Algorithm {
    pub const fn cose_alg(self) -> i64 {
        match self {
            Self::Es256 => cose::ALG_ES256,
            Self::MlDsa44 => cose::ALG_MLDSA44,
            Self::MlDsa65 => cose::ALG_MLDSA65,
            Self::HybridEs256MlDsa44 => cose::ALG_HYBRID_ES256_MLDSA44,
        }
    }

    pub fn from_cose(alg: i64) -> Option<Self> {
        match alg {
            cose::ALG_ES256 => Some(Self::Es256),
            cose::ALG_MLDSA44 => Some(Self::MlDsa44),
            cose::ALG_MLDSA65 => Some(Self::MlDsa65),
            cose::ALG_HYBRID_ES256_MLDSA44 => Some(Self::HybridEs256MlDsa44),
            _ => None,
        }
    }

    /// True when a private key for this algorithm can live in a P-256 key slot.
    pub const fn is_classical(self) -> bool {
        matches!(self, Self::Es256)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Es256 => "ES256",
            Self::MlDsa44 => "ML-DSA-44",
            Self::MlDsa65 => "ML-DSA-65",
            Self::HybridEs256MlDsa44 => "ES256+ML-DSA-44",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Public half of a credential or device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKey {
    Es256 { x: [u8; 32], y: [u8; 32] },
    MlDsa {
        algorithm: Algorithm,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    Hybrid {
        x: [u8; 32],
        y: [u8; 32],
        #[serde(with = "serde_bytes")]
        pqc: Vec<u8>,
    },
}

impl PublicKey {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Es256 { .. } => Algorithm::Es256,
            Self::MlDsa { algorithm, .. } => *algorithm,
            Self::Hybrid { .. } => Algorithm::HybridEs256MlDsa44,
        }
    }

    /// COSE_Key CBOR encoding as embedded in attested credential data.
    pub fn to_cose(&self) -> Vec<u8> {
        cose::encode_public_key(self)
    }

    /// Verify `signature` over a 32-byte digest.
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        match self {
            Self::Es256 { x, y } => ecdsa::verify(x, y, digest, signature),
            Self::MlDsa { algorithm, bytes } => mldsa::verify(*algorithm, bytes, digest, signature),
            Self::Hybrid { x, y, pqc } => hybrid::verify(x, y, pqc, digest, signature),
        }
    }
}

/// Private key material held by the software backend. Never leaves it.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    #[zeroize(skip)]
    pub algorithm: Algorithm,
    /// P-256 scalar, empty for pure ML-DSA keys.
    #[serde(with = "serde_bytes")]
    pub classical: Vec<u8>,
    /// ML-DSA private key, empty for ES256 keys.
    #[serde(with = "serde_bytes")]
    pub pqc: Vec<u8>,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").field("algorithm", &self.algorithm).finish_non_exhaustive()
    }
}

/// Generate a key pair for `algorithm` from the caller's RNG.
pub fn generate(
    algorithm: Algorithm,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<(SecretKey, PublicKey), CryptoError> {
    match algorithm {
        Algorithm::Es256 => {
            let (scalar, x, y) = ecdsa::generate(rng);
            Ok((
                SecretKey { algorithm, classical: scalar, pqc: Vec::new() },
                PublicKey::Es256 { x, y },
            ))
        }
        Algorithm::MlDsa44 | Algorithm::MlDsa65 => {
            let (sk, pk) = mldsa::generate(algorithm, rng)?;
            Ok((
                SecretKey { algorithm, classical: Vec::new(), pqc: sk },
                PublicKey::MlDsa { algorithm, bytes: pk },
            ))
        }
        Algorithm::HybridEs256MlDsa44 => {
            let (scalar, x, y) = ecdsa::generate(rng);
            let (sk, pk) = mldsa::generate(Algorithm::MlDsa44, rng)?;
            Ok((
                SecretKey { algorithm, classical: scalar, pqc: sk },
                PublicKey::Hybrid { x, y, pqc: pk },
            ))
        }
    }
}

/// Sign a 32-byte digest. Signing is hedged with `rng`.
pub fn sign(
    key: &SecretKey,
    digest: &[u8; 32],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<Vec<u8>, CryptoError> {
    match key.algorithm {
        Algorithm::Es256 => ecdsa::sign(&key.classical, digest, rng),
        Algorithm::MlDsa44 | Algorithm::MlDsa65 => mldsa::sign(key.algorithm, &key.pqc, digest, rng),
        Algorithm::HybridEs256MlDsa44 => {
            let der = ecdsa::sign(&key.classical, digest, rng)?;
            let pqc = mldsa::sign(Algorithm::MlDsa44, &key.pqc, digest, rng)?;
            Ok(hybrid::combine(&der, &pqc))
        }
    }
}

/// SHA-256 of `parts` concatenated.
pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
