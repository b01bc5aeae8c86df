pub const BROADCAST_CID: u32 = 0xFFFF_FFFF;
pub const RESERVED_CID: u32 = 0x0000_0000;

pub const CMD_PING: u8 = 0x01;
pub const CMD_INIT: u8 = 0x06;
pub const CMD_WINK: u8 = 0x08;
pub const CMD_CBOR: u8 = 0x10;
pub const CMD_CANCEL: u8 = 0x11;
pub const CMD_KEEPALIVE: u8 = 0x3B;
pub const CMD_ERROR: u8 = 0x3F;
/// Vendor command: CBOR map describing backend state and device identity.
pub const CMD_STATUS: u8 = 0x41;

pub const ERR_INVALID_CMD: u8 = 0x01;
pub const ERR_INVALID_PAR: u8 = 0x02;
pub const ERR_INVALID_LEN: u8 = 0x03;
pub const ERR_INVALID_SEQ: u8 = 0x04;
pub const ERR_MSG_TIMEOUT: u8 = 0x05;
pub const ERR_CHANNEL_BUSY: u8 = 0x06;
pub const ERR_INVALID_CHANNEL: u8 = 0x0B;
pub const ERR_OTHER: u8 = 0x7F;

pub const KEEPALIVE_STATUS_PROCESSING: u8 = 0x01;
pub const KEEPALIVE_STATUS_UPNEEDED: u8 = 0x02;

pub const CAP_WINK: u8 = 0x01;
pub const CAP_CBOR: u8 = 0x04;
pub const CAP_NMSG: u8 = 0x08;
pub const PIKEY_CAPABILITIES: u8 = CAP_WINK | CAP_CBOR | CAP_NMSG;

pub const PACKET_SIZE: usize = 64;
pub const INIT_DATA_SIZE: usize = PACKET_SIZE - 7;
pub const CONT_DATA_SIZE: usize = PACKET_SIZE - 5;
/// 57 bytes in the init frame plus 128 continuation frames of 59.
pub const MAX_MESSAGE_SIZE: usize = INIT_DATA_SIZE + 128 * CONT_DATA_SIZE;
pub const MAX_SEQ: u8 = 0x7F;

pub const INIT_NONCE_SIZE: usize = 8;
pub const INIT_RESPONSE_SIZE: usize = 17;
pub const CTAPHID_PROTOCOL_VERSION: u8 = 2;
pub const DEVICE_VERSION_MAJOR: u8 = 0;
pub const DEVICE_VERSION_MINOR: u8 = 1;
pub const DEVICE_VERSION_BUILD: u8 = 0;

/// CTAP2 status sent on CMD_CBOR when a request is cancelled.
pub(crate) const CTAP2_ERR_KEEPALIVE_CANCEL: u8 = 0x2D;

pub type Report = [u8; PACKET_SIZE];
