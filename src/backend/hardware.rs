use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ciborium::value::Value;

use super::slots::{DataSlot, SlotTable};
use super::{BackendError, BackendKind, Health, KeyPurpose, KeyReference, KeyStorage, SlotClass, SlotHandle};
use crate::crypto::{ecdsa, PublicKey};
use crate::se::{SeError, SecureElement};

/// Counters are keyed by the first bytes of the RP id hash so several RPs fit
/// in one small data slot.
const COUNTER_TAG_LEN: usize = 8;
const COUNTER_ENTRY_LEN: usize = COUNTER_TAG_LEN + 4;

fn se_error(e: SeError) -> BackendError {
    match e {
        SeError::TooLarge { .. } => BackendError::CapacityExhausted,
        SeError::BadSlot(_) => BackendError::InvalidReference,
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn counter_tag(rp_id_hash: &[u8; 32]) -> [u8; COUNTER_TAG_LEN] {
    let mut tag = [0u8; COUNTER_TAG_LEN];
    tag.copy_from_slice(&rp_id_hash[..COUNTER_TAG_LEN]);
    tag
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CounterTable {
    entries: Vec<([u8; COUNTER_TAG_LEN], u32)>,
}

impl CounterTable {
    /// `n | (tag, u32_be) * n`. A slot that does not parse is treated as blank.
    fn decode(bytes: &[u8]) -> Self {
        let n = bytes.first().copied().unwrap_or(0) as usize;
        if 1 + n * COUNTER_ENTRY_LEN > bytes.len() {
            return Self::default();
        }
        let entries = bytes[1..1 + n * COUNTER_ENTRY_LEN]
            .chunks_exact(COUNTER_ENTRY_LEN)
            .map(|chunk| {
                let mut tag = [0u8; COUNTER_TAG_LEN];
                tag.copy_from_slice(&chunk[..COUNTER_TAG_LEN]);
                let mut value = [0u8; 4];
                value.copy_from_slice(&chunk[COUNTER_TAG_LEN..]);
                (tag, u32::from_be_bytes(value))
            })
            .collect();
        Self { entries }
    }

    fn encode(&self, capacity: usize) -> Result<Vec<u8>, BackendError> {
        let len = 1 + self.entries.len() * COUNTER_ENTRY_LEN;
        if len > capacity || self.entries.len() > u8::MAX as usize {
            return Err(BackendError::CapacityExhausted);
        }
        let mut out = Vec::with_capacity(len);
        out.push(self.entries.len() as u8);
        for (tag, value) in &self.entries {
            out.extend_from_slice(tag);
            out.extend_from_slice(&value.to_be_bytes());
        }
        Ok(out)
    }

    fn get(&self, tag: &[u8; COUNTER_TAG_LEN]) -> Option<u32> {
        self.entries.iter().find(|(t, _)| t == tag).map(|(_, v)| *v)
    }

    fn set(&mut self, tag: [u8; COUNTER_TAG_LEN], value: u32) {
        match self.entries.iter_mut().find(|(t, _)| *t == tag) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((tag, value)),
        }
    }
}

/// `u16_be(len) || CBOR map { bytes => bytes }`. Zero or all-ones length is a blank slot.
fn decode_kv(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
    let Some(header) = bytes.get(..2) else {
        return Ok(Vec::new());
    };
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    if len == 0 || len == u16::MAX as usize {
        return Ok(Vec::new());
    }
    let body = bytes
        .get(2..2 + len)
        .ok_or_else(|| BackendError::Corrupt(format!("slot length {len} exceeds slot")))?;
    let value: Value =
        ciborium::from_reader(body).map_err(|e| BackendError::Corrupt(e.to_string()))?;
    let Value::Map(map) = value else {
        return Err(BackendError::Corrupt("slot table is not a map".into()));
    };
    map.into_iter()
        .map(|(k, v)| match (k, v) {
            (Value::Bytes(k), Value::Bytes(v)) => Ok((k, v)),
            _ => Err(BackendError::Corrupt("slot table entry is not bytes".into())),
        })
        .collect()
}

fn encode_kv(entries: &[(Vec<u8>, Vec<u8>)], capacity: usize) -> Result<Vec<u8>, BackendError> {
    let map = Value::Map(
        entries
            .iter()
            .map(|(k, v)| (Value::Bytes(k.clone()), Value::Bytes(v.clone())))
            .collect(),
    );
    let mut body = Vec::new();
    ciborium::into_writer(&map, &mut body).map_err(|e| BackendError::Corrupt(e.to_string()))?;
    if body.len() + 2 > capacity {
        return Err(BackendError::CapacityExhausted);
    }
    let mut out = (body.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(&body);
    Ok(out)
}

struct Inner {
    se: Box<dyn SecureElement>,
    table: SlotTable,
    /// Highest counter value handed out per RP since power-up.
    issued: HashMap<[u8; 32], u32>,
}

impl Inner {
    fn persist_table(&mut self) -> Result<(), BackendError> {
        self.se
            .write_data(DataSlot::SlotMap.number(), &self.table.to_bytes())
            .map_err(se_error)
    }

    fn read_kv(&mut self, slot: DataSlot) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        let raw = self.se.read_data(slot.number()).map_err(se_error)?;
        decode_kv(&raw)
    }

    fn write_kv(&mut self, slot: DataSlot, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<(), BackendError> {
        let capacity = self.se.data_capacity(slot.number());
        let bytes = encode_kv(entries, capacity)?;
        self.se.write_data(slot.number(), &bytes).map_err(se_error)
    }

    fn read_counters(&mut self, slot: DataSlot) -> Result<CounterTable, BackendError> {
        let raw = self.se.read_data(slot.number()).map_err(se_error)?;
        Ok(CounterTable::decode(&raw))
    }

    /// Effective counter: the larger of primary and backup, so a write torn
    /// between the two never moves the counter backwards.
    fn current_counter(&mut self, tag: &[u8; COUNTER_TAG_LEN]) -> Result<u32, BackendError> {
        let primary = self.read_counters(DataSlot::Counters)?.get(tag).unwrap_or(0);
        let backup = self.read_counters(DataSlot::CounterBackup)?.get(tag).unwrap_or(0);
        Ok(primary.max(backup))
    }

    fn persist_counter(&mut self, tag: [u8; COUNTER_TAG_LEN], value: u32) -> Result<(), BackendError> {
        for slot in [DataSlot::CounterBackup, DataSlot::Counters] {
            let mut table = self.read_counters(slot)?;
            table.set(tag, value);
            let bytes = table.encode(self.se.data_capacity(slot.number()))?;
            self.se.write_data(slot.number(), &bytes).map_err(se_error)?;
        }
        let stored = self.read_counters(DataSlot::Counters)?.get(&tag);
        if stored != Some(value) {
            return Err(BackendError::Integrity(format!(
                "counter read back as {stored:?}, expected {value}"
            )));
        }
        Ok(())
    }

    fn allocated_slot(&self, key: &KeyReference) -> Result<u8, BackendError> {
        match key {
            KeyReference::Hardware(SlotHandle(slot)) if self.table.is_allocated(*slot) => Ok(*slot),
            _ => Err(BackendError::InvalidReference),
        }
    }
}

/// Key storage on a secure element: one P-256 key per key slot, metadata and
/// counters packed into data slots.
pub struct HardwareBackend {
    inner: Mutex<Inner>,
}

impl HardwareBackend {
    pub fn open(mut se: Box<dyn SecureElement>) -> Result<Self, BackendError> {
        let raw = se.read_data(DataSlot::SlotMap.number()).map_err(se_error)?;
        let table = SlotTable::from_bytes(&raw);
        tracing::info!(
            allocated = ?table.allocated_slots().collect::<Vec<_>>(),
            free_user_slots = table.free_user_slots(),
            "Secure element slot table loaded"
        );
        Ok(Self { inner: Mutex::new(Inner { se, table, issued: HashMap::new() }) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BackendError> {
        self.inner
            .lock()
            .map_err(|_| BackendError::Unavailable("secure element lock poisoned".into()))
    }
}

impl Drop for HardwareBackend {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            inner.se.sleep();
        }
    }
}

impl KeyStorage for HardwareBackend {
    fn generate_key(&self, purpose: KeyPurpose) -> Result<(KeyReference, PublicKey), BackendError> {
        let algorithm = purpose.algorithm();
        if !algorithm.is_classical() {
            return Err(BackendError::Unsupported(algorithm));
        }
        let mut inner = self.lock()?;
        let slot = inner.table.choose(purpose)?;
        let raw = inner.se.generate_key(slot).map_err(se_error)?;
        let (x, y) = ecdsa::split_point(&raw)?;
        inner.table.mark(slot);
        inner.persist_table()?;
        tracing::debug!(slot, ?purpose, "Generated key in secure element");
        Ok((KeyReference::Hardware(SlotHandle(slot)), PublicKey::Es256 { x, y }))
    }

    fn sign(&self, key: &KeyReference, digest: &[u8; 32]) -> Result<Vec<u8>, BackendError> {
        let mut inner = self.lock()?;
        let slot = inner.allocated_slot(key)?;
        let raw = inner.se.sign_digest(slot, digest).map_err(se_error)?;
        Ok(ecdsa::der_from_raw(&raw)?)
    }

    fn secure_delete(&self, key: &KeyReference) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        let slot = inner.allocated_slot(key)?;
        // Regenerating replaces the private key; the old one is unrecoverable.
        inner.se.generate_key(slot).map_err(se_error)?;
        inner.table.release(slot);
        inner.persist_table()?;
        tracing::debug!(slot, "Key slot wiped");
        Ok(())
    }

    fn store_metadata(&self, class: SlotClass, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        let slot = DataSlot::from(class);
        let mut inner = self.lock()?;
        let mut entries = inner.read_kv(slot)?;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_vec(),
            None => entries.push((key.to_vec(), value.to_vec())),
        }
        inner.write_kv(slot, &entries)
    }

    fn load_metadata(&self, class: SlotClass, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        let mut inner = self.lock()?;
        let entries = inner.read_kv(DataSlot::from(class))?;
        Ok(entries.into_iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    fn remove_metadata(&self, class: SlotClass, key: &[u8]) -> Result<(), BackendError> {
        let slot = DataSlot::from(class);
        let mut inner = self.lock()?;
        let mut entries = inner.read_kv(slot)?;
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        if entries.len() != before {
            inner.write_kv(slot, &entries)?;
        }
        Ok(())
    }

    fn list_metadata(&self, class: SlotClass) -> Result<Vec<Vec<u8>>, BackendError> {
        let mut inner = self.lock()?;
        let entries = inner.read_kv(DataSlot::from(class))?;
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    fn increment_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        let tag = counter_tag(rp_id_hash);
        let mut inner = self.lock()?;
        let current = inner.current_counter(&tag)?;
        if let Some(&issued) = inner.issued.get(rp_id_hash) {
            if current < issued {
                return Err(BackendError::Integrity(format!(
                    "stored counter {current} is below issued value {issued}"
                )));
            }
        }
        let next = current
            .checked_add(1)
            .ok_or_else(|| BackendError::Integrity("counter exhausted".into()))?;
        inner.persist_counter(tag, next)?;
        inner.issued.insert(*rp_id_hash, next);
        Ok(next)
    }

    fn read_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        self.lock()?.current_counter(&counter_tag(rp_id_hash))
    }

    fn raise_counter(&self, rp_id_hash: &[u8; 32], minimum: u32) -> Result<u32, BackendError> {
        let tag = counter_tag(rp_id_hash);
        let mut inner = self.lock()?;
        let current = inner.current_counter(&tag)?;
        if current >= minimum {
            return Ok(current);
        }
        inner.persist_counter(tag, minimum)?;
        let issued = inner.issued.entry(*rp_id_hash).or_insert(minimum);
        *issued = (*issued).max(minimum);
        Ok(minimum)
    }

    fn health_check(&self) -> Health {
        let Ok(mut inner) = self.lock() else {
            return Health::Degraded;
        };
        match inner.se.random() {
            // An unconfigured chip answers with a fixed pattern.
            Ok(bytes) if bytes.iter().any(|b| *b != bytes[0]) => Health::Healthy,
            Ok(_) => {
                tracing::warn!("Secure element RNG returned a constant pattern");
                Health::Degraded
            }
            Err(e) => {
                tracing::warn!(error = %e, "Secure element health check failed");
                Health::Degraded
            }
        }
    }

    fn get_random(&self, len: usize) -> Result<Vec<u8>, BackendError> {
        let mut inner = self.lock()?;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let block = inner.se.random().map_err(se_error)?;
            let take = (len - out.len()).min(block.len());
            out.extend_from_slice(&block[..take]);
        }
        Ok(out)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Hardware
    }

    fn hardware_serial(&self) -> Option<[u8; 9]> {
        self.lock().ok()?.se.serial_number().ok()
    }

    fn wipe_all(&self) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        let slots: Vec<u8> = inner.table.allocated_slots().collect();
        for slot in slots {
            inner.se.generate_key(slot).map_err(se_error)?;
        }
        for slot in [
            DataSlot::Credentials,
            DataSlot::RpIndex,
            DataSlot::Pin,
            DataSlot::Identity,
            DataSlot::Counters,
            DataSlot::CounterBackup,
        ] {
            let blank = vec![0u8; inner.se.data_capacity(slot.number())];
            inner.se.write_data(slot.number(), &blank).map_err(se_error)?;
        }
        inner.table = SlotTable::default();
        inner.persist_table()?;
        inner.issued.clear();
        tracing::info!(target: "audit", backend = "hardware", "All keys and records wiped");
        Ok(())
    }
}
