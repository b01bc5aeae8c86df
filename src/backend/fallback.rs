use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    BackendError, BackendKind, Health, HardwareBackend, KeyPurpose, KeyReference, KeyStorage,
    SlotClass, SoftwareBackend,
};
use crate::crypto::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    HardwareActive,
    SoftwareActive,
}

struct State {
    current: BackendState,
    warning: Option<String>,
    /// Highest counter value returned per RP, across both backends.
    floors: HashMap<[u8; 32], u32>,
}

/// Routes key storage to the secure element while it is healthy and to the
/// software store once it is not.
///
/// The switch to software is one-way for the life of the process; only
/// [`FallbackManager::reprobe`] at (re)initialization moves back.
pub struct FallbackManager {
    hardware: Option<HardwareBackend>,
    software: SoftwareBackend,
    state: Mutex<State>,
}

impl FallbackManager {
    pub fn new(hardware: Option<HardwareBackend>, software: SoftwareBackend) -> Self {
        let manager = Self {
            hardware,
            software,
            state: Mutex::new(State {
                current: BackendState::SoftwareActive,
                warning: None,
                floors: HashMap::new(),
            }),
        };
        manager.reprobe();
        manager
    }

    /// Re-run the hardware health check and pick the active backend.
    pub fn reprobe(&self) -> BackendState {
        let next = match &self.hardware {
            Some(hw) if hw.health_check() == Health::Healthy => BackendState::HardwareActive,
            _ => BackendState::SoftwareActive,
        };
        if let Ok(mut state) = self.state.lock() {
            state.current = next;
        }
        tracing::info!(state = ?next, "Key storage backend selected");
        next
    }

    pub fn state(&self) -> BackendState {
        self.state
            .lock()
            .map(|s| s.current)
            .unwrap_or(BackendState::SoftwareActive)
    }

    /// The most recent degradation warning, if it has not been collected yet.
    pub fn take_warning(&self) -> Option<String> {
        self.state.lock().ok()?.warning.take()
    }

    /// Periodic supervision: degrade when the chip stops answering.
    pub fn supervise(&self) -> BackendState {
        if self.state() == BackendState::HardwareActive {
            if let Some(hw) = &self.hardware {
                if hw.health_check() == Health::Degraded {
                    self.degrade("secure element health check failed");
                }
            }
        }
        self.state()
    }

    fn degrade(&self, reason: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.current == BackendState::SoftwareActive {
            return;
        }
        state.current = BackendState::SoftwareActive;
        let warning = format!("secure element unavailable, continuing with software key storage: {reason}");
        tracing::warn!(target: "audit", reason, "Key storage degraded to software backend");
        state.warning = Some(warning);
    }

    /// Run `op` against the hardware backend; an `Unavailable` result moves
    /// the manager to software before the error is returned.
    fn on_hardware<T>(
        &self,
        hw: &HardwareBackend,
        op: impl FnOnce(&HardwareBackend) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let result = op(hw);
        if let Err(BackendError::Unavailable(reason)) = &result {
            self.degrade(reason);
        }
        result
    }

    fn active_hardware(&self) -> Option<&HardwareBackend> {
        match self.state() {
            BackendState::HardwareActive => self.hardware.as_ref(),
            BackendState::SoftwareActive => None,
        }
    }

    fn floor(&self, rp_id_hash: &[u8; 32]) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.floors.get(rp_id_hash).copied())
            .unwrap_or(0)
    }

    fn record_floor(&self, rp_id_hash: &[u8; 32], value: u32) {
        if let Ok(mut state) = self.state.lock() {
            let floor = state.floors.entry(*rp_id_hash).or_insert(0);
            *floor = (*floor).max(value);
        }
    }

    fn software_increment(&self, rp_id_hash: &[u8; 32], floor: u32) -> Result<u32, BackendError> {
        let value = self.software.increment_counter(rp_id_hash)?;
        if value <= floor {
            self.software.raise_counter(rp_id_hash, floor + 1)
        } else {
            Ok(value)
        }
    }

    /// Copy a hardware counter value into the software store so a later
    /// switch starts above it. The hardware value is already committed, so a
    /// failed copy is logged rather than failing the assertion.
    fn mirror_counter(&self, rp_id_hash: &[u8; 32], value: u32) {
        if let Err(e) = self.software.raise_counter(rp_id_hash, value) {
            tracing::warn!(error = %e, "Could not mirror signature counter to software store");
        }
    }

    pub fn software(&self) -> &SoftwareBackend {
        &self.software
    }
}

impl KeyStorage for FallbackManager {
    fn generate_key(&self, purpose: KeyPurpose) -> Result<(KeyReference, PublicKey), BackendError> {
        match self.active_hardware() {
            // Post-quantum keys never fit a P-256 slot.
            Some(hw) if purpose.algorithm().is_classical() => {
                self.on_hardware(hw, |hw| hw.generate_key(purpose))
            }
            _ => self.software.generate_key(purpose),
        }
    }

    fn sign(&self, key: &KeyReference, digest: &[u8; 32]) -> Result<Vec<u8>, BackendError> {
        match key {
            KeyReference::Hardware(_) => match &self.hardware {
                Some(hw) => self.on_hardware(hw, |hw| hw.sign(key, digest)),
                None => Err(BackendError::Unavailable("no secure element configured".into())),
            },
            KeyReference::Software(_) => self.software.sign(key, digest),
        }
    }

    fn secure_delete(&self, key: &KeyReference) -> Result<(), BackendError> {
        match key {
            KeyReference::Hardware(_) => match &self.hardware {
                Some(hw) => self.on_hardware(hw, |hw| hw.secure_delete(key)),
                None => Err(BackendError::Unavailable("no secure element configured".into())),
            },
            KeyReference::Software(_) => self.software.secure_delete(key),
        }
    }

    fn store_metadata(&self, class: SlotClass, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        let Some(hw) = self.active_hardware() else {
            return self.software.store_metadata(class, key, value);
        };
        match self.on_hardware(hw, |hw| hw.store_metadata(class, key, value)) {
            Ok(()) => self.software.remove_metadata(class, key),
            // Data slots are small; overflow spills to sealed software records.
            Err(BackendError::CapacityExhausted) => {
                self.on_hardware(hw, |hw| hw.remove_metadata(class, key))?;
                tracing::debug!(?class, "Metadata slot full, spilling record to software store");
                self.software.store_metadata(class, key, value)
            }
            Err(e) => Err(e),
        }
    }

    fn load_metadata(&self, class: SlotClass, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        match self.active_hardware() {
            Some(hw) => match self.on_hardware(hw, |hw| hw.load_metadata(class, key))? {
                Some(value) => Ok(Some(value)),
                None => self.software.load_metadata(class, key),
            },
            None => match self.software.load_metadata(class, key)? {
                Some(value) => Ok(Some(value)),
                // The chip may still hold records written before the switch.
                None => Ok(self
                    .hardware
                    .as_ref()
                    .and_then(|hw| hw.load_metadata(class, key).ok().flatten())),
            },
        }
    }

    fn remove_metadata(&self, class: SlotClass, key: &[u8]) -> Result<(), BackendError> {
        self.software.remove_metadata(class, key)?;
        if let Some(hw) = &self.hardware {
            match self.active_hardware() {
                Some(_) => self.on_hardware(hw, |hw| hw.remove_metadata(class, key))?,
                None => {
                    if let Err(e) = hw.remove_metadata(class, key) {
                        tracing::debug!(error = %e, "Could not remove metadata from inactive secure element");
                    }
                }
            }
        }
        Ok(())
    }

    fn list_metadata(&self, class: SlotClass) -> Result<Vec<Vec<u8>>, BackendError> {
        let mut keys = self.software.list_metadata(class)?;
        let from_hardware = match (&self.hardware, self.active_hardware()) {
            (Some(hw), Some(_)) => self.on_hardware(hw, |hw| hw.list_metadata(class))?,
            (Some(hw), None) => hw.list_metadata(class).unwrap_or_default(),
            (None, _) => Vec::new(),
        };
        for key in from_hardware {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn increment_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        // Software holds the mirror of every hardware value plus anything
        // counted while degraded, so it bounds the chip from below after a restart.
        let floor = self.floor(rp_id_hash).max(self.software.read_counter(rp_id_hash)?);
        let value = match self.active_hardware() {
            Some(hw) => match self.on_hardware(hw, |hw| hw.increment_counter(rp_id_hash)) {
                Ok(value) => {
                    let value = if value <= floor {
                        self.on_hardware(hw, |hw| hw.raise_counter(rp_id_hash, floor + 1))?
                    } else {
                        value
                    };
                    self.mirror_counter(rp_id_hash, value);
                    value
                }
                Err(BackendError::CapacityExhausted) => {
                    let floor = floor.max(hw.read_counter(rp_id_hash).unwrap_or(0));
                    tracing::debug!(rp = %hex::encode(&rp_id_hash[..8]), "Counter table full, counting in software");
                    self.software_increment(rp_id_hash, floor)?
                }
                Err(e) => return Err(e),
            },
            None => self.software_increment(rp_id_hash, floor)?,
        };
        self.record_floor(rp_id_hash, value);
        tracing::info!(target: "audit", rp = %hex::encode(&rp_id_hash[..8]), counter = value, "Signature counter incremented");
        Ok(value)
    }

    fn read_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        let software = self.software.read_counter(rp_id_hash)?;
        let hardware = self
            .hardware
            .as_ref()
            .filter(|_| self.state() == BackendState::HardwareActive)
            .map(|hw| hw.read_counter(rp_id_hash).unwrap_or(0))
            .unwrap_or(0);
        Ok(software.max(hardware).max(self.floor(rp_id_hash)))
    }

    fn raise_counter(&self, rp_id_hash: &[u8; 32], minimum: u32) -> Result<u32, BackendError> {
        let value = match self.active_hardware() {
            Some(hw) => match self.on_hardware(hw, |hw| hw.raise_counter(rp_id_hash, minimum)) {
                Ok(value) => {
                    self.mirror_counter(rp_id_hash, value);
                    value
                }
                Err(BackendError::CapacityExhausted) => self.software.raise_counter(rp_id_hash, minimum)?,
                Err(e) => return Err(e),
            },
            None => self.software.raise_counter(rp_id_hash, minimum)?,
        };
        self.record_floor(rp_id_hash, value);
        Ok(value)
    }

    fn health_check(&self) -> Health {
        match self.active_hardware() {
            Some(hw) => hw.health_check(),
            None => self.software.health_check(),
        }
    }

    fn get_random(&self, len: usize) -> Result<Vec<u8>, BackendError> {
        match self.active_hardware() {
            Some(hw) => self.on_hardware(hw, |hw| hw.get_random(len)),
            None => self.software.get_random(len),
        }
    }

    fn kind(&self) -> BackendKind {
        match self.state() {
            BackendState::HardwareActive => BackendKind::Hardware,
            BackendState::SoftwareActive => BackendKind::Software,
        }
    }

    fn hardware_serial(&self) -> Option<[u8; 9]> {
        self.active_hardware()?.hardware_serial()
    }

    fn wipe_all(&self) -> Result<(), BackendError> {
        if let Some(hw) = &self.hardware {
            hw.wipe_all()?;
        }
        self.software.wipe_all()?;
        if let Ok(mut state) = self.state.lock() {
            state.floors.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cipher::AesGcmCipher;
    use crate::crypto::Algorithm;
    use crate::se::sim::SimulatedElement;
    use crate::se::{SeError, SecureElement};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    const CRED: KeyPurpose = KeyPurpose::Credential(Algorithm::Es256);

    fn manager(dir: &std::path::Path) -> (FallbackManager, Arc<AtomicBool>) {
        let se = SimulatedElement::with_capacity(1, 4096, 512);
        let fault = se.fault_switch();
        let hw = HardwareBackend::open(Box::new(se)).unwrap();
        let sw = SoftwareBackend::open(dir, Box::new(AesGcmCipher::new([1u8; 32])), 32, [2u8; 32]).unwrap();
        (FallbackManager::new(Some(hw), sw), fault)
    }

    #[test]
    fn test_starts_on_hardware_when_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = manager(dir.path());
        assert_eq!(m.state(), BackendState::HardwareActive);
        assert_eq!(m.kind(), BackendKind::Hardware);
        let (key, _) = m.generate_key(CRED).unwrap();
        assert!(matches!(key, KeyReference::Hardware(_)));
    }

    #[test]
    fn test_software_only_without_chip() {
        let dir = tempfile::tempdir().unwrap();
        let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([1u8; 32])), 8, [2u8; 32]).unwrap();
        let m = FallbackManager::new(None, sw);
        assert_eq!(m.state(), BackendState::SoftwareActive);
        assert_eq!(m.hardware_serial(), None);
        let (key, _) = m.generate_key(CRED).unwrap();
        assert!(matches!(key, KeyReference::Software(_)));
    }

    #[test]
    fn test_pqc_goes_to_software_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _) = manager(dir.path());
        let (key, public) = m.generate_key(KeyPurpose::Credential(Algorithm::MlDsa65)).unwrap();
        assert!(matches!(key, KeyReference::Software(_)));
        assert_eq!(m.state(), BackendState::HardwareActive);
        let sig = m.sign(&key, &[1u8; 32]).unwrap();
        assert!(public.verify(&[1u8; 32], &sig));
    }

    #[test]
    fn test_unavailable_fails_once_then_software() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fault) = manager(dir.path());
        fault.store(true, Ordering::SeqCst);

        assert!(matches!(m.generate_key(CRED), Err(BackendError::Unavailable(_))));
        assert_eq!(m.state(), BackendState::SoftwareActive);
        assert!(m.take_warning().is_some());
        assert!(m.take_warning().is_none());

        let (key, _) = m.generate_key(CRED).unwrap();
        assert!(matches!(key, KeyReference::Software(_)));
    }

    #[test]
    fn test_supervise_degrades_and_hardware_records_survive() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fault) = manager(dir.path());
        let (hw_key, hw_public) = m.generate_key(CRED).unwrap();
        m.store_metadata(SlotClass::Credentials, b"hw-cred", b"record").unwrap();

        fault.store(true, Ordering::SeqCst);
        assert_eq!(m.supervise(), BackendState::SoftwareActive);
        let (sw_key, _) = m.generate_key(CRED).unwrap();
        assert!(matches!(sw_key, KeyReference::Software(_)));
        m.store_metadata(SlotClass::Credentials, b"sw-cred", b"record").unwrap();

        // Chip comes back: its credential still signs and its metadata is intact.
        fault.store(false, Ordering::SeqCst);
        let sig = m.sign(&hw_key, &[9u8; 32]).unwrap();
        assert!(hw_public.verify(&[9u8; 32], &sig));
        assert_eq!(
            m.load_metadata(SlotClass::Credentials, b"hw-cred").unwrap(),
            Some(b"record".to_vec())
        );
        let mut listed = m.list_metadata(SlotClass::Credentials).unwrap();
        listed.sort();
        assert_eq!(listed, vec![b"hw-cred".to_vec(), b"sw-cred".to_vec()]);
        // Still software until re-initialized.
        assert_eq!(m.state(), BackendState::SoftwareActive);
        assert_eq!(m.reprobe(), BackendState::HardwareActive);
    }

    #[test]
    fn test_full_metadata_slot_spills_to_software() {
        let dir = tempfile::tempdir().unwrap();
        let se = SimulatedElement::with_capacity(3, 64, 64);
        let hw = HardwareBackend::open(Box::new(se)).unwrap();
        let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([1u8; 32])), 8, [2u8; 32]).unwrap();
        let m = FallbackManager::new(Some(hw), sw);

        m.store_metadata(SlotClass::Credentials, b"a", b"small").unwrap();
        let large = vec![0xAB; 200];
        m.store_metadata(SlotClass::Credentials, b"a", &large).unwrap();
        assert_eq!(m.state(), BackendState::HardwareActive);
        assert_eq!(m.load_metadata(SlotClass::Credentials, b"a").unwrap(), Some(large));
        assert_eq!(m.list_metadata(SlotClass::Credentials).unwrap(), vec![b"a".to_vec()]);

        // Shrinking again moves the record back onto the chip.
        m.store_metadata(SlotClass::Credentials, b"a", b"tiny").unwrap();
        assert_eq!(m.software().load_metadata(SlotClass::Credentials, b"a").unwrap(), None);
        assert_eq!(m.load_metadata(SlotClass::Credentials, b"a").unwrap(), Some(b"tiny".to_vec()));
    }

    #[test]
    fn test_counter_never_decreases_across_switch() {
        let dir = tempfile::tempdir().unwrap();
        let (m, fault) = manager(dir.path());
        let rp = [4u8; 32];
        assert_eq!(m.increment_counter(&rp).unwrap(), 1);
        assert_eq!(m.increment_counter(&rp).unwrap(), 2);
        fault.store(true, Ordering::SeqCst);
        m.supervise();
        assert_eq!(m.increment_counter(&rp).unwrap(), 3);
        assert_eq!(m.read_counter(&rp).unwrap(), 3);
    }

    #[test]
    fn test_counter_mirror_survives_restart_in_software() {
        let dir = tempfile::tempdir().unwrap();
        let rp = [5u8; 32];
        {
            let (m, _) = manager(dir.path());
            for _ in 0..4 {
                m.increment_counter(&rp).unwrap();
            }
        }
        let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([1u8; 32])), 32, [2u8; 32]).unwrap();
        let m = FallbackManager::new(None, sw);
        assert_eq!(m.increment_counter(&rp).unwrap(), 5);
    }

    #[test]
    fn test_counter_table_overflow_counts_in_software() {
        let dir = tempfile::tempdir().unwrap();
        let hw = HardwareBackend::open(Box::new(SimulatedElement::new(3))).unwrap();
        let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([1u8; 32])), 8, [2u8; 32]).unwrap();
        let m = FallbackManager::new(Some(hw), sw);

        for i in 1..=8u8 {
            assert_eq!(m.increment_counter(&[i; 32]).unwrap(), 1, "rp {i}");
        }
        for i in 1..=8u8 {
            assert_eq!(m.increment_counter(&[i; 32]).unwrap(), 2, "rp {i}");
        }
        assert_eq!(m.state(), BackendState::HardwareActive);
        assert_eq!(m.read_counter(&[8u8; 32]).unwrap(), 2);
        assert_eq!(m.raise_counter(&[8u8; 32], 10).unwrap(), 10);
        assert_eq!(m.increment_counter(&[8u8; 32]).unwrap(), 11);
    }

    /// Lets two managers in sequence talk to the same chip, like a reboot.
    struct SharedChip(Arc<Mutex<SimulatedElement>>);

    impl SecureElement for SharedChip {
        fn serial_number(&mut self) -> Result<[u8; 9], SeError> {
            self.0.lock().unwrap().serial_number()
        }
        fn random(&mut self) -> Result<[u8; 32], SeError> {
            self.0.lock().unwrap().random()
        }
        fn generate_key(&mut self, slot: u8) -> Result<[u8; 64], SeError> {
            self.0.lock().unwrap().generate_key(slot)
        }
        fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<[u8; 64], SeError> {
            self.0.lock().unwrap().sign_digest(slot, digest)
        }
        fn read_data(&mut self, slot: u8) -> Result<Vec<u8>, SeError> {
            self.0.lock().unwrap().read_data(slot)
        }
        fn write_data(&mut self, slot: u8, data: &[u8]) -> Result<(), SeError> {
            self.0.lock().unwrap().write_data(slot, data)
        }
        fn data_capacity(&self, slot: u8) -> usize {
            self.0.lock().unwrap().data_capacity(slot)
        }
    }

    #[test]
    fn test_counter_after_restart_stays_above_software_value() {
        let dir = tempfile::tempdir().unwrap();
        let chip = Arc::new(Mutex::new(SimulatedElement::with_capacity(1, 4096, 512)));
        let fault = chip.lock().unwrap().fault_switch();
        let open = |chip: &Arc<Mutex<SimulatedElement>>| {
            let hw = HardwareBackend::open(Box::new(SharedChip(chip.clone()))).unwrap();
            let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([1u8; 32])), 32, [2u8; 32]).unwrap();
            FallbackManager::new(Some(hw), sw)
        };
        let rp = [6u8; 32];
        {
            let m = open(&chip);
            assert_eq!(m.increment_counter(&rp).unwrap(), 1);
            assert_eq!(m.increment_counter(&rp).unwrap(), 2);
            fault.store(true, Ordering::SeqCst);
            assert_eq!(m.supervise(), BackendState::SoftwareActive);
            for expected in 3..=5 {
                assert_eq!(m.increment_counter(&rp).unwrap(), expected);
            }
        }
        // Chip is healthy again after reboot but its own table still says 2.
        fault.store(false, Ordering::SeqCst);
        let m = open(&chip);
        assert_eq!(m.state(), BackendState::HardwareActive);
        assert_eq!(m.increment_counter(&rp).unwrap(), 6);
        assert_eq!(m.increment_counter(&rp).unwrap(), 7);
    }
}
