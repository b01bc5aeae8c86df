//! Microchip ATECC608 command layer.
//!
//! Packets are `count | opcode | param1 | param2 (LE) | data | crc16 (LE)`,
//! written after the command word address. Responses are
//! `count | data | crc16 (LE)`.

use std::time::Duration;

use super::i2c::ByteBus;
use super::{check_data_slot, check_key_slot, SeError, SecureElement};

const WORD_ADDRESS_COMMAND: u8 = 0x03;
const WORD_ADDRESS_IDLE: u8 = 0x02;
const WORD_ADDRESS_SLEEP: u8 = 0x01;

const WAKE_RESPONSE: [u8; 4] = [0x04, 0x11, 0x33, 0x43];

const OP_READ: u8 = 0x02;
const OP_WRITE: u8 = 0x12;
const OP_NONCE: u8 = 0x16;
const OP_RANDOM: u8 = 0x1B;
const OP_GENKEY: u8 = 0x40;
const OP_SIGN: u8 = 0x41;

const ZONE_CONFIG: u8 = 0x00;
const ZONE_DATA: u8 = 0x02;
const ZONE_READ_32: u8 = 0x80;

const GENKEY_MODE_PRIVATE: u8 = 0x04;
const NONCE_MODE_PASSTHROUGH: u8 = 0x03;
const SIGN_MODE_EXTERNAL: u8 = 0x80;

const BLOCK_SIZE: usize = 32;
/// Slot 8 holds 416 bytes; slots 9..=15 hold 72, of which two whole blocks
/// are reachable with 32-byte accesses.
const LARGE_SLOT: u8 = 8;
const LARGE_SLOT_BLOCKS: usize = 13;
const SMALL_SLOT_BLOCKS: usize = 2;

/// `count | data(≤64) | crc`: the largest response any command here produces.
const MAX_RESPONSE: usize = 1 + 64 + 2;

/// CRC-16 as computed by the chip: polynomial 0x8005, bits consumed LSB
/// first, result little endian.
pub(crate) fn crc16(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0;
    for byte in data {
        for bit in 0..8 {
            let data_bit = (byte >> bit) & 1;
            let crc_bit = ((crc >> 15) & 1) as u8;
            crc <<= 1;
            if data_bit != crc_bit {
                crc ^= 0x8005;
            }
        }
    }
    crc.to_le_bytes()
}

pub(crate) fn encode_command(opcode: u8, param1: u8, param2: u16, data: &[u8]) -> Vec<u8> {
    let count = (7 + data.len()) as u8;
    let mut packet = Vec::with_capacity(count as usize);
    packet.push(count);
    packet.push(opcode);
    packet.push(param1);
    packet.extend_from_slice(&param2.to_le_bytes());
    packet.extend_from_slice(data);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc);
    packet
}

/// Validate a full response frame and return its data bytes.
pub(crate) fn decode_response(frame: &[u8]) -> Result<Vec<u8>, SeError> {
    let count = *frame.first().ok_or(SeError::ShortResponse(0))? as usize;
    if count < 4 || frame.len() < count {
        return Err(SeError::ShortResponse(count));
    }
    let (body, crc) = frame[..count].split_at(count - 2);
    if crc16(body) != crc {
        return Err(SeError::Crc);
    }
    Ok(body[1..].to_vec())
}

fn data_address(slot: u8, block: usize) -> u16 {
    ((block as u16) << 8) | ((slot as u16) << 3)
}

struct Command<'a> {
    opcode: u8,
    param1: u8,
    param2: u16,
    data: &'a [u8],
    exec_time: Duration,
    response_len: usize,
}

pub struct Atecc608<B: ByteBus> {
    bus: B,
    awake: bool,
}

impl<B: ByteBus> Atecc608<B> {
    pub fn new(bus: B) -> Self {
        Self { bus, awake: false }
    }

    fn wake(&mut self) -> Result<(), SeError> {
        if self.awake {
            return Ok(());
        }
        self.bus.wake_pulse()?;
        let mut response = [0u8; 4];
        self.bus.read(&mut response)?;
        if response != WAKE_RESPONSE {
            tracing::debug!(?response, "unexpected wake response");
            return Err(SeError::NoWake);
        }
        self.awake = true;
        Ok(())
    }

    /// Idle keeps TempKey alive until the watchdog fires, unlike sleep.
    fn idle(&mut self) {
        if self.awake {
            let _ = self.bus.write(&[WORD_ADDRESS_IDLE]);
            self.awake = false;
        }
    }

    fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, SeError>) -> Result<T, SeError> {
        self.wake()?;
        let result = f(self);
        self.idle();
        result
    }

    fn execute(&mut self, cmd: Command<'_>) -> Result<Vec<u8>, SeError> {
        let mut out = vec![WORD_ADDRESS_COMMAND];
        out.extend(encode_command(cmd.opcode, cmd.param1, cmd.param2, cmd.data));
        self.bus.write(&out)?;
        std::thread::sleep(cmd.exec_time);

        let mut frame = vec![0u8; MAX_RESPONSE];
        self.bus.read(&mut frame[..1])?;
        let count = frame[0] as usize;
        if !(4..=MAX_RESPONSE).contains(&count) {
            return Err(SeError::ShortResponse(count));
        }
        self.bus.read(&mut frame[1..count])?;
        let body = decode_response(&frame[..count])?;

        if body.len() == 1 && cmd.response_len != 1 {
            return Err(if body[0] == 0 { SeError::ShortResponse(1) } else { SeError::Status(body[0]) });
        }
        if cmd.response_len == 1 && body[0] != 0 {
            return Err(SeError::Status(body[0]));
        }
        if body.len() != cmd.response_len {
            return Err(SeError::ShortResponse(body.len()));
        }
        Ok(body)
    }

    fn read_block(&mut self, zone: u8, address: u16) -> Result<[u8; 32], SeError> {
        let body = self.execute(Command {
            opcode: OP_READ,
            param1: zone | ZONE_READ_32,
            param2: address,
            data: &[],
            exec_time: Duration::from_millis(5),
            response_len: BLOCK_SIZE,
        })?;
        let mut block = [0u8; 32];
        block.copy_from_slice(&body);
        Ok(block)
    }

    fn write_block(&mut self, address: u16, block: &[u8]) -> Result<(), SeError> {
        self.execute(Command {
            opcode: OP_WRITE,
            param1: ZONE_DATA | ZONE_READ_32,
            param2: address,
            data: block,
            exec_time: Duration::from_millis(26),
            response_len: 1,
        })?;
        Ok(())
    }

    fn blocks(slot: u8) -> usize {
        if slot == LARGE_SLOT {
            LARGE_SLOT_BLOCKS
        } else {
            SMALL_SLOT_BLOCKS
        }
    }
}

fn to_64(body: Vec<u8>) -> Result<[u8; 64], SeError> {
    body.as_slice().try_into().map_err(|_| SeError::ShortResponse(body.len()))
}

impl<B: ByteBus> SecureElement for Atecc608<B> {
    fn serial_number(&mut self) -> Result<[u8; 9], SeError> {
        self.transaction(|chip| {
            let config = chip.read_block(ZONE_CONFIG, 0)?;
            let mut serial = [0u8; 9];
            serial[..4].copy_from_slice(&config[0..4]);
            serial[4..].copy_from_slice(&config[8..13]);
            Ok(serial)
        })
    }

    fn random(&mut self) -> Result<[u8; 32], SeError> {
        self.transaction(|chip| {
            let body = chip.execute(Command {
                opcode: OP_RANDOM,
                param1: 0x00,
                param2: 0x0000,
                data: &[],
                exec_time: Duration::from_millis(23),
                response_len: 32,
            })?;
            let mut out = [0u8; 32];
            out.copy_from_slice(&body);
            Ok(out)
        })
    }

    fn generate_key(&mut self, slot: u8) -> Result<[u8; 64], SeError> {
        check_key_slot(slot)?;
        self.transaction(|chip| {
            let body = chip.execute(Command {
                opcode: OP_GENKEY,
                param1: GENKEY_MODE_PRIVATE,
                param2: slot as u16,
                data: &[],
                exec_time: Duration::from_millis(115),
                response_len: 64,
            })?;
            to_64(body)
        })
    }

    fn sign_digest(&mut self, slot: u8, digest: &[u8; 32]) -> Result<[u8; 64], SeError> {
        check_key_slot(slot)?;
        self.transaction(|chip| {
            // Load the digest into TempKey, then sign TempKey.
            chip.execute(Command {
                opcode: OP_NONCE,
                param1: NONCE_MODE_PASSTHROUGH,
                param2: 0x0000,
                data: digest,
                exec_time: Duration::from_millis(7),
                response_len: 1,
            })?;
            let body = chip.execute(Command {
                opcode: OP_SIGN,
                param1: SIGN_MODE_EXTERNAL,
                param2: slot as u16,
                data: &[],
                exec_time: Duration::from_millis(70),
                response_len: 64,
            })?;
            to_64(body)
        })
    }

    fn read_data(&mut self, slot: u8) -> Result<Vec<u8>, SeError> {
        check_data_slot(slot)?;
        self.transaction(|chip| {
            let mut out = Vec::with_capacity(Self::blocks(slot) * BLOCK_SIZE);
            for block in 0..Self::blocks(slot) {
                out.extend_from_slice(&chip.read_block(ZONE_DATA, data_address(slot, block))?);
            }
            Ok(out)
        })
    }

    fn write_data(&mut self, slot: u8, data: &[u8]) -> Result<(), SeError> {
        check_data_slot(slot)?;
        let capacity = self.data_capacity(slot);
        if data.len() > capacity {
            return Err(SeError::TooLarge { slot, len: data.len(), capacity });
        }
        self.transaction(|chip| {
            for (block, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
                let mut padded = [0u8; BLOCK_SIZE];
                padded[..chunk.len()].copy_from_slice(chunk);
                chip.write_block(data_address(slot, block), &padded)?;
            }
            Ok(())
        })
    }

    fn data_capacity(&self, slot: u8) -> usize {
        Self::blocks(slot) * BLOCK_SIZE
    }

    fn sleep(&mut self) {
        if self.wake().is_ok() {
            let _ = self.bus.write(&[WORD_ADDRESS_SLEEP]);
        }
        self.awake = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Bus that records writes and replays queued response bytes.
    #[derive(Clone, Default)]
    struct ScriptedBus {
        reads: Arc<Mutex<VecDeque<u8>>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ScriptedBus {
        fn queue(&self, bytes: &[u8]) {
            self.reads.lock().unwrap().extend(bytes.iter().copied());
        }

        fn queue_response(&self, body: &[u8]) {
            let mut frame = vec![(body.len() + 3) as u8];
            frame.extend_from_slice(body);
            let crc = crc16(&frame);
            frame.extend_from_slice(&crc);
            self.queue(&frame);
        }
    }

    impl ByteBus for ScriptedBus {
        fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
            let mut reads = self.reads.lock().unwrap();
            for b in buf.iter_mut() {
                *b = reads.pop_front().ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            }
            Ok(())
        }

        fn wake_pulse(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_crc_matches_wake_response() {
        assert_eq!(crc16(&[0x04, 0x11]), [0x33, 0x43]);
        assert_eq!(crc16(&[0x04, 0x00]), [0x03, 0x40]);
        assert_eq!(crc16(&[0x04, 0x0F]), [0x23, 0x42]);
    }

    #[test]
    fn test_encode_random_command() {
        assert_eq!(
            encode_command(OP_RANDOM, 0x00, 0x0000, &[]),
            vec![0x07, 0x1B, 0x00, 0x00, 0x00, 0x24, 0xCD]
        );
    }

    #[test]
    fn test_encode_param2_little_endian() {
        let packet = encode_command(OP_READ, 0x82, data_address(8, 1), &[]);
        assert_eq!(&packet[3..5], &[0x40, 0x01], "slot 8 block 1 is address 0x0140");
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        assert!(matches!(decode_response(&[0x04, 0x00, 0x00, 0x00]), Err(SeError::Crc)));
        assert!(matches!(decode_response(&[0x02, 0x00]), Err(SeError::ShortResponse(2))));
        assert_eq!(decode_response(&[0x04, 0x00, 0x03, 0x40]).unwrap(), vec![0x00]);
    }

    #[test]
    fn test_random_roundtrip() {
        let bus = ScriptedBus::default();
        bus.queue(&WAKE_RESPONSE);
        bus.queue_response(&[0xAB; 32]);
        let mut chip = Atecc608::new(bus.clone());

        assert_eq!(chip.random().unwrap(), [0xAB; 32]);

        let writes = bus.writes.lock().unwrap();
        assert_eq!(writes[0][0], WORD_ADDRESS_COMMAND);
        assert_eq!(&writes[0][1..], &[0x07, 0x1B, 0x00, 0x00, 0x00, 0x24, 0xCD]);
        assert_eq!(writes.last().unwrap(), &vec![WORD_ADDRESS_IDLE]);
    }

    #[test]
    fn test_bad_wake_response() {
        let bus = ScriptedBus::default();
        bus.queue(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let mut chip = Atecc608::new(bus);
        assert!(matches!(chip.random(), Err(SeError::NoWake)));
    }

    #[test]
    fn test_execution_error_status() {
        let bus = ScriptedBus::default();
        bus.queue(&WAKE_RESPONSE);
        bus.queue_response(&[0x0F]);
        let mut chip = Atecc608::new(bus);
        let err = chip.sign_digest(3, &[0u8; 32]).unwrap_err();
        assert!(matches!(err, SeError::Status(0x0F)));
        assert!(err.is_unresponsive());
    }

    #[test]
    fn test_sign_sends_nonce_then_sign() {
        let bus = ScriptedBus::default();
        bus.queue(&WAKE_RESPONSE);
        bus.queue_response(&[0x00]);
        bus.queue_response(&[0x5A; 64]);
        let mut chip = Atecc608::new(bus.clone());

        assert_eq!(chip.sign_digest(2, &[0x11; 32]).unwrap(), [0x5A; 64]);

        let writes = bus.writes.lock().unwrap();
        assert_eq!(writes[0][2], OP_NONCE);
        assert_eq!(writes[0][3], NONCE_MODE_PASSTHROUGH);
        assert_eq!(&writes[0][6..38], &[0x11; 32]);
        assert_eq!(writes[1][2], OP_SIGN);
        assert_eq!(writes[1][3], SIGN_MODE_EXTERNAL);
        assert_eq!(writes[1][4], 2, "slot goes in param2");
    }

    #[test]
    fn test_serial_number_from_config_zone() {
        let bus = ScriptedBus::default();
        bus.queue(&WAKE_RESPONSE);
        let mut config = [0u8; 32];
        config[..4].copy_from_slice(&[0x01, 0x23, 0x45, 0x67]);
        config[8..13].copy_from_slice(&[0x89, 0xAB, 0xCD, 0xEF, 0xEE]);
        bus.queue_response(&config);
        let mut chip = Atecc608::new(bus);
        assert_eq!(
            chip.serial_number().unwrap(),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xEE]
        );
    }

    #[test]
    fn test_write_data_checks_capacity_and_slot() {
        let mut chip = Atecc608::new(ScriptedBus::default());
        assert_eq!(chip.data_capacity(8), 416);
        assert_eq!(chip.data_capacity(12), 64);
        assert!(matches!(
            chip.write_data(12, &[0u8; 65]),
            Err(SeError::TooLarge { slot: 12, len: 65, capacity: 64 })
        ));
        assert!(matches!(chip.write_data(3, &[0u8; 4]), Err(SeError::BadSlot(3))));
        assert!(matches!(chip.generate_key(9), Err(SeError::BadSlot(9))));
    }

    #[test]
    fn test_write_data_pads_to_blocks() {
        let bus = ScriptedBus::default();
        bus.queue(&WAKE_RESPONSE);
        bus.queue_response(&[0x00]);
        bus.queue_response(&[0x00]);
        let mut chip = Atecc608::new(bus.clone());
        chip.write_data(9, &[0x77; 40]).unwrap();

        let writes = bus.writes.lock().unwrap();
        let commands: Vec<_> = writes.iter().filter(|w| w[0] == WORD_ADDRESS_COMMAND).collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1][1], 7 + 32, "each write carries one 32-byte block");
        assert_eq!(&commands[1][6..14], &[0x77; 8]);
        assert_eq!(&commands[1][14..38], &[0u8; 24]);
    }
}
