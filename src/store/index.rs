use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::credential::{CredentialRecord, CREDENTIAL_ID_LEN, RECORD_VERSION};
use super::identity::DeviceIdentity;
use super::pin::PinState;
use super::StoreError;
use crate::backend::{BackendError, KeyPurpose, KeyStorage, SlotClass};
use crate::crypto::{sha256, Algorithm};
use crate::ctap2::authenticator_data::{build_get_assertion_auth_data, build_make_cred_auth_data};
use crate::up::UserPresenceProof;

type CredentialId = [u8; CREDENTIAL_ID_LEN];

const PIN_KEY: &[u8] = b"state";

/// Parameters of a new credential, already validated by the caller.
#[derive(Debug, Clone)]
pub struct CredentialRequest<'a> {
    pub rp_id: &'a str,
    pub user_handle: &'a [u8],
    pub user_name: Option<&'a str>,
    pub user_display: Option<&'a str>,
    pub algorithm: Algorithm,
    pub discoverable: bool,
    /// Refuse instead of replacing an existing credential for the same user.
    pub exclusive: bool,
}

#[derive(Debug)]
pub struct Assertion {
    pub auth_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub sign_counter: u32,
}

/// Packed attestation over a freshly created credential.
#[derive(Debug)]
pub struct Attestation {
    pub auth_data: Vec<u8>,
    pub algorithm: Algorithm,
    pub signature: Vec<u8>,
    /// Present for basic attestation; self attestation carries no chain.
    pub certificate: Option<Vec<u8>>,
}

pub struct CredentialStore {
    backend: Arc<dyn KeyStorage>,
    identity: DeviceIdentity,
    by_id: HashMap<CredentialId, CredentialRecord>,
    by_rp: HashMap<[u8; 32], Vec<CredentialId>>,
    next_serial: u64,
}

impl CredentialStore {
    /// Load identity and every credential record from the backend, then
    /// bring the persisted RP index in line with the records.
    pub fn open(backend: Arc<dyn KeyStorage>, attestation_certificate: Option<Vec<u8>>) -> Result<Self, StoreError> {
        let identity = DeviceIdentity::load_or_create(backend.as_ref(), attestation_certificate)?;
        let mut by_id = HashMap::new();
        let mut by_rp: HashMap<[u8; 32], Vec<CredentialId>> = HashMap::new();
        let mut next_serial = 0;
        for key in backend.list_metadata(SlotClass::Credentials)? {
            let Some(bytes) = backend.load_metadata(SlotClass::Credentials, &key)? else {
                continue;
            };
            let record = match CredentialRecord::from_bytes(&bytes) {
                Ok(record) if record.credential_id == key => record,
                Ok(_) => {
                    tracing::warn!("Skipping credential record stored under a foreign id");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable credential record");
                    continue;
                }
            };
            next_serial = next_serial.max(record.serial + 1);
            let id = record.id_array();
            by_rp.entry(record.rp_id_hash).or_default().push(id);
            by_id.insert(id, record);
        }

        let store = Self { backend, identity, by_id, by_rp, next_serial };
        store.reconcile_index()?;
        tracing::info!(count = store.by_id.len(), backend = %store.backend.kind(), "Credential store loaded");
        Ok(store)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn backend(&self) -> &Arc<dyn KeyStorage> {
        &self.backend
    }

    pub fn credential_count(&self) -> usize {
        self.by_id.len()
    }

    /// Look up by credential_id regardless of RP.
    pub fn record(&self, id: &[u8]) -> Option<&CredentialRecord> {
        let id: CredentialId = id.try_into().ok()?;
        self.by_id.get(&id)
    }

    pub fn create_credential(
        &mut self,
        request: &CredentialRequest<'_>,
        _proof: &UserPresenceProof,
    ) -> Result<CredentialRecord, StoreError> {
        let rp_id_hash = sha256(&[request.rp_id.as_bytes()]);
        let existing = self.by_rp.get(&rp_id_hash).and_then(|ids| {
            ids.iter()
                .find(|id| self.by_id.get(*id).is_some_and(|r| r.user_handle == request.user_handle))
                .copied()
        });
        if existing.is_some() && request.exclusive {
            return Err(StoreError::DuplicateCredential);
        }

        let credential_id = self.backend.get_random(CREDENTIAL_ID_LEN)?;
        if credential_id.len() != CREDENTIAL_ID_LEN {
            return Err(StoreError::Corrupt("backend returned a short random id".into()));
        }
        let sign_counter = self.backend.read_counter(&rp_id_hash)?;
        let (key_reference, public_key) = self.backend.generate_key(KeyPurpose::Credential(request.algorithm))?;

        let record = CredentialRecord {
            version: RECORD_VERSION,
            credential_id,
            rp_id: request.rp_id.to_string(),
            rp_id_hash,
            user_handle: request.user_handle.to_vec(),
            user_name: request.user_name.map(str::to_string),
            user_display: request.user_display.map(str::to_string),
            algorithm: request.algorithm,
            public_key,
            key_reference,
            created_at: unix_now(),
            serial: self.next_serial,
            discoverable: request.discoverable,
            unusable: false,
            sign_counter,
        };

        // The key must not outlive a record that failed to persist.
        if let Err(e) = self.persist_record(&record) {
            if let Err(wipe) = self.backend.secure_delete(&record.key_reference) {
                tracing::warn!(error = %wipe, "Could not wipe key of unpersisted credential");
            }
            return Err(e);
        }
        self.next_serial += 1;
        let id = record.id_array();
        self.by_rp.entry(rp_id_hash).or_default().push(id);
        self.by_id.insert(id, record.clone());
        self.persist_index(&rp_id_hash)?;

        tracing::info!(
            target: "audit",
            rp_id = %record.rp_id,
            algorithm = %record.algorithm,
            discoverable = record.discoverable,
            "Credential created"
        );

        if let Some(old) = existing {
            if let Err(e) = self.delete_credential(&old) {
                tracing::warn!(error = %e, "Could not remove replaced credential");
            }
        }
        Ok(record)
    }

    /// Credentials for an RP, newest first. With `allowed`, only the listed
    /// ids are yielded.
    pub fn find_credentials<'a>(
        &'a self,
        rp_id_hash: &[u8; 32],
        allowed: Option<&[Vec<u8>]>,
    ) -> Result<Credentials<'a>, StoreError> {
        let mut ids: Vec<CredentialId> = self
            .by_rp
            .get(rp_id_hash)
            .map(|ids| {
                ids.iter()
                    .filter(|id| allowed.map_or(true, |list| list.iter().any(|a| a.as_slice() == id.as_slice())))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        ids.sort_by_key(|id| Reverse(self.by_id.get(id).map_or(0, |r| r.serial)));
        let sign_counter = if ids.is_empty() { 0 } else { self.backend.read_counter(rp_id_hash)? };
        Ok(Credentials { store: self, ids: ids.into_iter(), sign_counter })
    }

    /// Bump the RP counter, then sign SHA-256(authData || clientDataHash).
    pub fn assert(
        &mut self,
        record: &CredentialRecord,
        client_data_hash: &[u8],
        flags: u8,
        _proof: &UserPresenceProof,
    ) -> Result<Assertion, StoreError> {
        let id = record.id_array();
        let stored = self.by_id.get(&id).ok_or(StoreError::NotFound)?;
        if stored.unusable {
            return Err(StoreError::Unusable);
        }
        let rp_id_hash = stored.rp_id_hash;
        let key_reference = stored.key_reference.clone();

        let sign_counter = match self.backend.increment_counter(&rp_id_hash) {
            Ok(counter) => counter,
            Err(BackendError::Integrity(reason)) => {
                tracing::error!(target: "audit", rp_id = %stored.rp_id, %reason, "Counter integrity failure, disabling credential");
                if let Err(e) = self.mark_unusable(&id) {
                    tracing::warn!(error = %e, "Could not persist unusable flag");
                }
                return Err(BackendError::Integrity(reason).into());
            }
            Err(e) => return Err(e.into()),
        };

        let auth_data = build_get_assertion_auth_data(&rp_id_hash, flags, sign_counter);
        let digest = sha256(&[&auth_data, client_data_hash]);
        let signature = self.backend.sign(&key_reference, &digest).map_err(reference_error)?;
        Ok(Assertion { auth_data, signature, sign_counter })
    }

    /// Attestation for a credential returned by `create_credential`.
    pub fn attest(&self, record: &CredentialRecord, client_data_hash: &[u8], flags: u8) -> Result<Attestation, StoreError> {
        let auth_data = build_make_cred_auth_data(
            &record.rp_id_hash,
            flags,
            record.sign_counter,
            &self.identity.aaguid,
            &record.credential_id,
            &record.public_key.to_cose(),
        );
        let digest = sha256(&[&auth_data, client_data_hash]);
        let (key, algorithm) = match self.identity.certificate {
            Some(_) => (&self.identity.attestation_key, Algorithm::Es256),
            None => (&record.key_reference, record.algorithm),
        };
        let signature = self.backend.sign(key, &digest).map_err(reference_error)?;
        Ok(Attestation {
            auth_data,
            algorithm,
            signature,
            certificate: self.identity.certificate.clone(),
        })
    }

    /// Wipe the key, then the record, then the index entry.
    pub fn delete_credential(&mut self, id: &[u8]) -> Result<(), StoreError> {
        let key: CredentialId = id.try_into().map_err(|_| StoreError::NotFound)?;
        let record = self.by_id.get(&key).ok_or(StoreError::NotFound)?;
        let rp_id_hash = record.rp_id_hash;
        match self.backend.secure_delete(&record.key_reference) {
            Ok(()) | Err(BackendError::InvalidReference) => {}
            Err(e) => return Err(e.into()),
        }
        self.backend.remove_metadata(SlotClass::Credentials, id)?;

        let removed = self.by_id.remove(&key);
        if let Some(ids) = self.by_rp.get_mut(&rp_id_hash) {
            ids.retain(|i| i != &key);
            if ids.is_empty() {
                self.by_rp.remove(&rp_id_hash);
            }
        }
        self.persist_index(&rp_id_hash)?;
        if let Some(record) = removed {
            tracing::info!(target: "audit", rp_id = %record.rp_id, "Credential deleted");
        }
        Ok(())
    }

    /// Delete every credential and the PIN. Device identity survives.
    pub fn reset(&mut self) -> Result<usize, StoreError> {
        let ids: Vec<CredentialId> = self.by_id.keys().copied().collect();
        for id in &ids {
            self.delete_credential(id)?;
        }
        self.backend.remove_metadata(SlotClass::Pin, PIN_KEY)?;
        tracing::info!(target: "audit", count = ids.len(), "Authenticator reset");
        Ok(ids.len())
    }

    pub fn pin_state(&self) -> Result<PinState, StoreError> {
        match self.backend.load_metadata(SlotClass::Pin, PIN_KEY)? {
            Some(bytes) => ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(PinState::default()),
        }
    }

    pub fn save_pin_state(&self, state: &PinState) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(state, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.backend.store_metadata(SlotClass::Pin, PIN_KEY, &buf)?;
        Ok(())
    }

    fn mark_unusable(&mut self, id: &CredentialId) -> Result<(), StoreError> {
        let Some(record) = self.by_id.get_mut(id) else {
            return Err(StoreError::NotFound);
        };
        record.unusable = true;
        let record = record.clone();
        self.persist_record(&record)
    }

    fn persist_record(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let bytes = record.to_bytes()?;
        self.backend.store_metadata(SlotClass::Credentials, &record.credential_id, &bytes)?;
        Ok(())
    }

    fn persist_index(&self, rp_id_hash: &[u8; 32]) -> Result<(), StoreError> {
        match self.by_rp.get(rp_id_hash) {
            Some(ids) => self.backend.store_metadata(SlotClass::RpIndex, rp_id_hash, &encode_index(ids))?,
            None => self.backend.remove_metadata(SlotClass::RpIndex, rp_id_hash)?,
        }
        Ok(())
    }

    fn reconcile_index(&self) -> Result<(), StoreError> {
        let mut rewritten = 0usize;
        for (rp_id_hash, ids) in &self.by_rp {
            let expected = encode_index(ids);
            if self.backend.load_metadata(SlotClass::RpIndex, rp_id_hash)?.as_ref() != Some(&expected) {
                self.backend.store_metadata(SlotClass::RpIndex, rp_id_hash, &expected)?;
                rewritten += 1;
            }
        }
        for key in self.backend.list_metadata(SlotClass::RpIndex)? {
            let known = <[u8; 32]>::try_from(key.as_slice()).is_ok_and(|rp| self.by_rp.contains_key(&rp));
            if !known {
                self.backend.remove_metadata(SlotClass::RpIndex, &key)?;
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            tracing::info!(count = rewritten, "Rewrote stale RP index entries");
        }
        Ok(())
    }
}

/// Restartable iterator over the records matched by `find_credentials`.
#[derive(Clone)]
pub struct Credentials<'a> {
    store: &'a CredentialStore,
    ids: std::vec::IntoIter<CredentialId>,
    sign_counter: u32,
}

impl Iterator for Credentials<'_> {
    type Item = CredentialRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            if let Some(record) = self.store.by_id.get(&id) {
                let mut record = record.clone();
                record.sign_counter = self.sign_counter;
                return Some(record);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}

/// Sorted concatenation of credential ids.
fn encode_index(ids: &[CredentialId]) -> Vec<u8> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.concat()
}

fn reference_error(e: BackendError) -> StoreError {
    match e {
        BackendError::InvalidReference => StoreError::ReferenceInvalid,
        other => other.into(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}
