use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::backend::KeyReference;
use crate::crypto::{Algorithm, PublicKey};

pub const RECORD_VERSION: u8 = 2;
pub const CREDENTIAL_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub version: u8,
    #[serde(with = "serde_bytes")]
    pub credential_id: Vec<u8>, // 32 bytes random
    pub rp_id: String,
    pub rp_id_hash: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub user_handle: Vec<u8>,
    pub user_name: Option<String>,
    pub user_display: Option<String>,
    pub algorithm: Algorithm,
    pub public_key: PublicKey,
    pub key_reference: KeyReference,
    pub created_at: u64, // Unix timestamp
    /// Creation order, breaks ties between records made in the same second.
    pub serial: u64,
    pub discoverable: bool,
    /// Set after a counter integrity failure; the credential never signs again.
    #[serde(default)]
    pub unusable: bool,
    /// Counter value at the time the record was handed out. Not persisted.
    #[serde(skip)]
    pub sign_counter: u32,
}

impl CredentialRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let record: Self = ciborium::from_reader(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if record.credential_id.len() != CREDENTIAL_ID_LEN {
            return Err(StoreError::Corrupt("credential_id not 32 bytes".into()));
        }
        if record.public_key.algorithm() != record.algorithm {
            return Err(StoreError::Corrupt("public key does not match algorithm".into()));
        }
        Ok(record)
    }

    pub(crate) fn id_array(&self) -> [u8; CREDENTIAL_ID_LEN] {
        let mut id = [0u8; CREDENTIAL_ID_LEN];
        id.copy_from_slice(&self.credential_id);
        id
    }
}
