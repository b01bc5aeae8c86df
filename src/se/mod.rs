//! Slot-addressed secure element primitives.
//!
//! [`SecureElement`] is the narrow surface the hardware key-storage backend
//! needs: a P-256 key per key slot, opaque data slots, a serial number and a
//! hardware RNG. [`atecc::Atecc608`] drives a real chip over I2C and
//! [`sim::SimulatedElement`] keeps the same model in memory.

pub mod atecc;
pub mod i2c;
pub mod sim;

/// Total slots on the chip; 0..KEY_SLOT_COUNT hold private keys, the rest hold data.
pub const SLOT_COUNT: u8 = 16;
pub const KEY_SLOT_COUNT: u8 = 8;

#[derive(Debug, thiserror::Error)]
pub enum SeError {
    #[error("bus: {0}")]
    Bus(#[from] std::io::Error),
    #[error("chip did not answer the wake sequence")]
    NoWake,
    #[error("response CRC mismatch")]
    Crc,
    #[error("chip returned status {0:#04x}")]
    Status(u8),
    #[error("unexpected response length {0}")]
    ShortResponse(usize),
    #[error("slot {0} cannot be used for this operation")]
    BadSlot(u8),
    #[error("{len} bytes exceed the {capacity}-byte capacity of slot {slot}")]
    TooLarge { slot: u8, len: usize, capacity: usize },
}

impl SeError {
    /// True when the chip (or the bus to it) stopped answering, as opposed to a
    /// caller mistake such as a bad slot number.
    pub fn is_unresponsive(&self) -> bool {
        matches!(
            self,
            Self::Bus(_) | Self::NoWake | Self::Crc | Self::Status(_) | Self::ShortResponse(_)
        )
    }
}

pub trait SecureElement: Send {
    /// Nine-byte chip serial number.
    fn serial_number(&mut self) -> Result<[u8; 9], SeError>;

    /// 32 bytes from the chip's RNG.
    fn random(&mut self) -> Result<[u8; 32], SeError>;

    /// Generate a fresh P-256 key in `slot`, destroying whatever was there.
    /// Returns the uncompressed public point `x || y`.
    fn generate_key(&mut self, slot: u8) -> Result<[u8; 64], SeError>;

    /// Sign a 32-byte digest with the key in `slot`. Returns raw `r || s`.
    fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<[u8; 64], SeError>;

    /// Contents of a data slot, always `data_capacity(slot)` bytes long.
    fn read_data(&mut self, slot: u8) -> Result<Vec<u8>, SeError>;

    /// Write `data` at the start of a data slot.
    fn write_data(&mut self, slot: u8, data: &[u8]) -> Result<(), SeError>;

    fn data_capacity(&self, slot: u8) -> usize;

    /// Put the chip into low-power sleep. Best effort.
    fn sleep(&mut self) {}
}

pub(crate) fn check_key_slot(slot: u8) -> Result<(), SeError> {
    if slot < KEY_SLOT_COUNT {
        Ok(())
    } else {
        Err(SeError::BadSlot(slot))
    }
}

pub(crate) fn check_data_slot(slot: u8) -> Result<(), SeError> {
    if (KEY_SLOT_COUNT..SLOT_COUNT).contains(&slot) {
        Ok(())
    } else {
        Err(SeError::BadSlot(slot))
    }
}
