//! Key storage: where private keys, credential metadata and signature
//! counters live.
//!
//! [`KeyStorage`] is implemented by [`hardware::HardwareBackend`] (secure
//! element slots), [`software::SoftwareBackend`] (sealed files) and
//! [`fallback::FallbackManager`], which routes between the two.

pub mod cipher;
pub mod fallback;
pub mod hardware;
pub mod slots;
pub mod software;

use serde::{Deserialize, Serialize};

use crate::crypto::{Algorithm, CryptoError, PublicKey};

pub use fallback::{BackendState, FallbackManager};
pub use hardware::HardwareBackend;
pub use software::SoftwareBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no free key slot or record")]
    CapacityExhausted,
    #[error("key reference does not name an allocated key")]
    InvalidReference,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0} keys are not supported by this backend")]
    Unsupported(Algorithm),
    #[error("counter integrity violation: {0}")]
    Integrity(String),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// What a freshly generated key is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    DeviceIdentity,
    Attestation,
    Credential(Algorithm),
}

impl KeyPurpose {
    pub fn algorithm(self) -> Algorithm {
        match self {
            Self::DeviceIdentity | Self::Attestation => Algorithm::Es256,
            Self::Credential(alg) => alg,
        }
    }
}

/// Opaque handle to a private key held by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyReference {
    Hardware(SlotHandle),
    Software(RecordId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotHandle(pub(crate) u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub(crate) [u8; 16]);

impl RecordId {
    pub(crate) fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Metadata namespaces. Each maps to one data slot on hardware and one
/// directory on software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    Credentials,
    RpIndex,
    Pin,
    Identity,
}

impl SlotClass {
    pub const ALL: [SlotClass; 4] = [Self::Credentials, Self::RpIndex, Self::Pin, Self::Identity];

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::RpIndex => "rp_index",
            Self::Pin => "pin",
            Self::Identity => "identity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Hardware,
    Software,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
        })
    }
}

/// Operations every key-storage backend provides. Implementations serialize
/// mutation internally, so all methods take `&self`.
pub trait KeyStorage: Send + Sync {
    fn generate_key(&self, purpose: KeyPurpose) -> Result<(KeyReference, PublicKey), BackendError>;

    /// Sign a 32-byte digest. Returns the algorithm's wire signature (DER for ES256).
    fn sign(&self, key: &KeyReference, digest: &[u8; 32]) -> Result<Vec<u8>, BackendError>;

    /// Wipe the key so the reference can never sign again.
    fn secure_delete(&self, key: &KeyReference) -> Result<(), BackendError>;

    fn store_metadata(&self, class: SlotClass, key: &[u8], value: &[u8]) -> Result<(), BackendError>;
    fn load_metadata(&self, class: SlotClass, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError>;
    fn remove_metadata(&self, class: SlotClass, key: &[u8]) -> Result<(), BackendError>;
    fn list_metadata(&self, class: SlotClass) -> Result<Vec<Vec<u8>>, BackendError>;

    /// Persist and return the next counter value for an RP.
    fn increment_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError>;
    fn read_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError>;
    /// Ensure the stored counter is at least `minimum`; returns the stored value.
    fn raise_counter(&self, rp_id_hash: &[u8; 32], minimum: u32) -> Result<u32, BackendError>;

    fn health_check(&self) -> Health;
    fn get_random(&self, len: usize) -> Result<Vec<u8>, BackendError>;
    fn kind(&self) -> BackendKind;

    /// Secure element serial number, when a chip is present and answering.
    fn hardware_serial(&self) -> Option<[u8; 9]> {
        None
    }

    /// Destroy every key, metadata record and counter.
    fn wipe_all(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_hex() {
        let id = RecordId([0x00, 0x7f, 0xab, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(id.hex(), "007fabff000000000000000000000001");
    }

    #[test]
    fn test_purpose_algorithm() {
        assert_eq!(KeyPurpose::Attestation.algorithm(), Algorithm::Es256);
        assert_eq!(
            KeyPurpose::Credential(Algorithm::MlDsa65).algorithm(),
            Algorithm::MlDsa65
        );
    }
}
