use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use p256::ecdsa::signature::hazmat::RandomizedPrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{check_data_slot, check_key_slot, SeError, SecureElement, KEY_SLOT_COUNT, SLOT_COUNT};

/// Execution error status the chip reports for a slot without a key.
const STATUS_EXECUTION_ERROR: u8 = 0x0F;

/// In-memory secure element with the same slot model as the real chip.
///
/// Used by tests and for bring-up on boards without the chip. Setting the
/// handle returned by [`SimulatedElement::fault_switch`] makes every
/// operation fail as if the bus went quiet.
pub struct SimulatedElement {
    serial: [u8; 9],
    keys: Vec<Option<SigningKey>>,
    data: Vec<Vec<u8>>,
    capacities: Vec<usize>,
    rng: StdRng,
    fault: Arc<AtomicBool>,
}

impl SimulatedElement {
    /// Capacities default to the real chip's (416 bytes in slot 8, 64 elsewhere).
    pub fn new(seed: u64) -> Self {
        Self::with_capacity(seed, 416, 64)
    }

    pub fn with_capacity(seed: u64, large_slot: usize, small_slot: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut serial = [0u8; 9];
        rng.fill_bytes(&mut serial);
        serial[0] = 0x01;
        serial[1] = 0x23;
        let capacities: Vec<usize> = (0..SLOT_COUNT)
            .map(|slot| match slot {
                s if s < KEY_SLOT_COUNT => 0,
                8 => large_slot,
                _ => small_slot,
            })
            .collect();
        let data = capacities.iter().map(|&c| vec![0u8; c]).collect();
        Self {
            serial,
            keys: (0..KEY_SLOT_COUNT).map(|_| None).collect(),
            data,
            capacities,
            rng,
            fault: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fault_switch(&self) -> Arc<AtomicBool> {
        self.fault.clone()
    }

    fn check_alive(&self) -> Result<(), SeError> {
        if self.fault.load(Ordering::SeqCst) {
            Err(SeError::NoWake)
        } else {
            Ok(())
        }
    }
}

impl SecureElement for SimulatedElement {
    fn serial_number(&mut self) -> Result<[u8; 9], SeError> {
        self.check_alive()?;
        Ok(self.serial)
    }

    fn random(&mut self) -> Result<[u8; 32], SeError> {
        self.check_alive()?;
        let mut out = [0u8; 32];
        self.rng.fill_bytes(&mut out);
        Ok(out)
    }

    fn generate_key(&mut self, slot: u8) -> Result<[u8; 64], SeError> {
        check_key_slot(slot)?;
        self.check_alive()?;
        let key = SigningKey::random(&mut self.rng);
        let point = key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..]);
        self.keys[slot as usize] = Some(key);
        Ok(out)
    }

    fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<[u8; 64], SeError> {
        check_key_slot(slot)?;
        self.check_alive()?;
        let key = self.keys[slot as usize].as_ref().ok_or(SeError::Status(STATUS_EXECUTION_ERROR))?;
        let signature: Signature = key
            .sign_prehash_with_rng(&mut self.rng, digest)
            .map_err(|_| SeError::Status(STATUS_EXECUTION_ERROR))?;
        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }

    fn read_data(&mut self, slot: u8) -> Result<Vec<u8>, SeError> {
        check_data_slot(slot)?;
        self.check_alive()?;
        Ok(self.data[slot as usize].clone())
    }

    fn write_data(&mut self, slot: u8, data: &[u8]) -> Result<(), SeError> {
        check_data_slot(slot)?;
        self.check_alive()?;
        let capacity = self.capacities[slot as usize];
        if data.len() > capacity {
            return Err(SeError::TooLarge { slot, len: data.len(), capacity });
        }
        self.data[slot as usize][..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn data_capacity(&self, slot: u8) -> usize {
        self.capacities.get(slot as usize).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_requires_generated_key() {
        let mut se = SimulatedElement::new(1);
        assert!(matches!(se.sign_digest(2, &[0u8; 32]), Err(SeError::Status(0x0F))));
        se.generate_key(2).unwrap();
        se.sign_digest(2, &[0u8; 32]).unwrap();
    }

    #[test]
    fn test_fault_switch_silences_chip() {
        let mut se = SimulatedElement::new(2);
        let fault = se.fault_switch();
        fault.store(true, Ordering::SeqCst);
        assert!(matches!(se.random(), Err(SeError::NoWake)));
        fault.store(false, Ordering::SeqCst);
        assert!(se.random().is_ok());
    }

    #[test]
    fn test_data_slot_keeps_capacity() {
        let mut se = SimulatedElement::with_capacity(3, 1024, 256);
        se.write_data(9, &[1, 2, 3]).unwrap();
        let data = se.read_data(9).unwrap();
        assert_eq!(data.len(), 256);
        assert_eq!(&data[..3], &[1, 2, 3]);
        assert!(se.write_data(9, &[0u8; 257]).is_err());
        assert!(se.read_data(1).is_err());
    }
}
