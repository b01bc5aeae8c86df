use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{UpPrompt, UserPresence, UserPresenceProof};
use crate::ctap2::types::Ctap2Error;

/// Confirms every request without asking. For benches and tests.
#[derive(Debug, Default)]
pub struct AutoConfirm;

impl UserPresence for AutoConfirm {
    fn confirm(&self, prompt: &UpPrompt, cancel: &AtomicBool, _timeout: Duration) -> Result<UserPresenceProof, Ctap2Error> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Ctap2Error::KeepaliveCancel);
        }
        tracing::debug!(prompt = %prompt.description, "Auto-confirming user presence");
        Ok(UserPresenceProof { _private: () })
    }
}
