use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, TryRecvError};
use std::time::Duration;

use super::{poll_until, UpPrompt, UserPresence, UserPresenceProof};
use crate::ctap2::types::Ctap2Error;

/// Desktop confirmation dialog through a pinentry binary.
pub struct PinentryPresence {
    binary: String,
}

impl PinentryPresence {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl UserPresence for PinentryPresence {
    fn confirm(&self, prompt: &UpPrompt, cancel: &AtomicBool, timeout: Duration) -> Result<UserPresenceProof, Ctap2Error> {
        let (tx, rx) = mpsc::channel();
        let bin = self.binary.clone();
        let title = prompt.title.clone();
        let description = prompt.description.clone();

        // The dialog blocks; it outlives a cancelled or timed-out request
        // until the user dismisses it, and its answer is then ignored.
        std::thread::spawn(move || {
            let answer = match pinentry::ConfirmationDialog::with_binary(&bin) {
                None => Err(pinentry::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "pinentry binary not found",
                ))),
                Some(mut dialog) => dialog
                    .with_title(&title)
                    .with_ok("Confirm")
                    .with_cancel("Deny")
                    .confirm(&description),
            };
            tx.send(answer).ok();
        });

        poll_until(cancel, timeout, || match rx.try_recv() {
            Ok(Ok(true)) => Ok(true),
            Ok(Ok(false)) => Err(Ctap2Error::OperationDenied),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "pinentry failed");
                Err(Ctap2Error::OperationDenied)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(Ctap2Error::OperationDenied),
        })
    }
}
