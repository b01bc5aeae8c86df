//! Fixed slot layout of the secure element.

use super::{BackendError, KeyPurpose, SlotClass};

pub const IDENTITY_KEY_SLOT: u8 = 0;
pub const ATTESTATION_KEY_SLOT: u8 = 1;
pub const FIRST_USER_KEY_SLOT: u8 = 2;
pub const LAST_USER_KEY_SLOT: u8 = 7;

/// Data slots. Slot 14 is left as scratch for provisioning tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataSlot {
    Credentials = 8,
    RpIndex = 9,
    Pin = 10,
    Identity = 11,
    Counters = 12,
    CounterBackup = 13,
    SlotMap = 15,
}

impl DataSlot {
    pub const fn number(self) -> u8 {
        self as u8
    }
}

impl From<SlotClass> for DataSlot {
    fn from(class: SlotClass) -> Self {
        match class {
            SlotClass::Credentials => Self::Credentials,
            SlotClass::RpIndex => Self::RpIndex,
            SlotClass::Pin => Self::Pin,
            SlotClass::Identity => Self::Identity,
        }
    }
}

const SLOT_MAP_MAGIC: [u8; 2] = *b"SM";

/// Allocation bitmap for the eight key slots, persisted in [`DataSlot::SlotMap`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotTable {
    allocated: u8,
}

impl SlotTable {
    /// Decode the persisted form. Anything unrecognized (a blank chip) is an
    /// empty table.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            [m0, m1, bits, check, ..] if [*m0, *m1] == SLOT_MAP_MAGIC && *check == !*bits => {
                Self { allocated: *bits }
            }
            _ => Self::default(),
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [SLOT_MAP_MAGIC[0], SLOT_MAP_MAGIC[1], self.allocated, !self.allocated]
    }

    pub fn is_allocated(self, slot: u8) -> bool {
        slot < 8 && self.allocated & (1 << slot) != 0
    }

    /// Pick the slot a new key for `purpose` goes into. Device keys have
    /// fixed slots; credential keys take the lowest free user slot.
    pub fn choose(self, purpose: KeyPurpose) -> Result<u8, BackendError> {
        match purpose {
            KeyPurpose::DeviceIdentity => Ok(IDENTITY_KEY_SLOT),
            KeyPurpose::Attestation => Ok(ATTESTATION_KEY_SLOT),
            KeyPurpose::Credential(_) => (FIRST_USER_KEY_SLOT..=LAST_USER_KEY_SLOT)
                .find(|&slot| !self.is_allocated(slot))
                .ok_or(BackendError::CapacityExhausted),
        }
    }

    pub fn mark(&mut self, slot: u8) {
        self.allocated |= 1 << slot;
    }

    pub fn release(&mut self, slot: u8) {
        self.allocated &= !(1 << slot);
    }

    pub fn allocated_slots(self) -> impl Iterator<Item = u8> {
        (0..8u8).filter(move |&slot| self.is_allocated(slot))
    }

    pub fn free_user_slots(self) -> usize {
        (FIRST_USER_KEY_SLOT..=LAST_USER_KEY_SLOT)
            .filter(|&slot| !self.is_allocated(slot))
            .count()
    }
}
