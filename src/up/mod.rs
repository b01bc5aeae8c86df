//! User presence: a physical confirmation gate in front of every signing
//! operation. Handlers obtain a [`UserPresenceProof`] from a [`UserPresence`]
//! implementation and the credential store demands it by type.

mod auto;
mod button;
mod pinentry;
mod prompt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::ctap2::types::Ctap2Error;

pub use auto::AutoConfirm;
pub use button::GpioButton;
pub use pinentry::PinentryPresence;
pub use prompt::{get_assertion_prompt, make_credential_prompt, reset_prompt, UpPrompt};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct UserPresenceProof {
    pub(crate) _private: (),
}

impl UserPresenceProof {
    /// Construct a proof for use in tests only.
    /// Do not use in production code; this bypasses user presence verification.
    #[doc(hidden)]
    pub fn test_only() -> Self {
        Self { _private: () }
    }
}

pub trait UserPresence: Send + Sync {
    /// Block until the user confirms, denies, the request is cancelled, or
    /// `timeout` elapses.
    fn confirm(&self, prompt: &UpPrompt, cancel: &AtomicBool, timeout: Duration) -> Result<UserPresenceProof, Ctap2Error>;
}

/// Poll `check` until it reports presence. Cancellation wins over a
/// simultaneous confirmation.
pub(crate) fn poll_until(
    cancel: &AtomicBool,
    timeout: Duration,
    mut check: impl FnMut() -> Result<bool, Ctap2Error>,
) -> Result<UserPresenceProof, Ctap2Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Ctap2Error::KeepaliveCancel);
        }
        if check()? {
            return Ok(UserPresenceProof { _private: () });
        }
        if Instant::now() >= deadline {
            return Err(Ctap2Error::UserActionTimeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
