pub mod channel;
pub mod dispatch;
pub mod engine;
pub mod packet;
pub mod types;

pub use dispatch::run_ctaphid_loop;
pub use engine::{Action, Engine, EngineState};

#[derive(Debug, thiserror::Error)]
pub enum CtapHidError {
    #[error("Channel busy")]
    ChannelBusy,
    #[error("Invalid channel: {0:#x}")]
    InvalidChannel(u32),
    #[error("Bad sequence number: {0}")]
    InvalidSeq(u8),
    #[error("Invalid length: {0}")]
    InvalidLen(usize),
    #[error("Invalid command: {0:#04x}")]
    InvalidCmd(u8),
    #[error("Message assembly timed out")]
    Timeout,
}

impl CtapHidError {
    pub fn code(&self) -> u8 {
        match self {
            CtapHidError::ChannelBusy => types::ERR_CHANNEL_BUSY,
            CtapHidError::InvalidChannel(_) => types::ERR_INVALID_CHANNEL,
            CtapHidError::InvalidSeq(_) => types::ERR_INVALID_SEQ,
            CtapHidError::InvalidLen(_) => types::ERR_INVALID_LEN,
            CtapHidError::InvalidCmd(_) => types::ERR_INVALID_CMD,
            CtapHidError::Timeout => types::ERR_MSG_TIMEOUT,
        }
    }
}
