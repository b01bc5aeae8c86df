use serde::{Deserialize, Serialize};

use crate::config::PIN_RETRIES;

/// Persisted ClientPIN state. Absent hash means no PIN is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinState {
    pub pin_hash: Option<[u8; 16]>,
    pub retries: u8,
}

impl Default for PinState {
    fn default() -> Self {
        Self { pin_hash: None, retries: PIN_RETRIES }
    }
}

impl PinState {
    pub fn is_set(&self) -> bool {
        self.pin_hash.is_some()
    }
}
