pub mod types;
pub(crate) mod authenticator_data;
pub(crate) mod attestation;
pub(crate) mod make_credential;
pub(crate) mod get_assertion;
pub(crate) mod get_info;
pub(crate) mod client_pin;
pub(crate) mod reset;
mod authenticator;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

pub use authenticator::Authenticator;
use types::*;

/// Shared between the dispatch loop and the worker running one command.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub cancel: Arc<AtomicBool>,
    pub keepalive: Arc<AtomicU8>,
}

impl CommandContext {
    pub fn new() -> Self {
        let ctx = Self::default();
        ctx.keepalive.store(crate::ctaphid::types::KEEPALIVE_STATUS_PROCESSING, Ordering::Relaxed);
        ctx
    }

    /// Checkpoint between sub-steps of a command.
    pub fn check_cancel(&self) -> Result<(), Ctap2Error> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Ctap2Error::KeepaliveCancel)
        } else {
            Ok(())
        }
    }
}

/// Run one CTAP2 command. `payload` is the command byte followed by its CBOR
/// parameters; the result is a status byte followed by the CBOR response.
pub fn process(auth: &Authenticator, payload: &[u8], ctx: &CommandContext) -> Vec<u8> {
    let Some((&cmd, body)) = payload.split_first() else {
        return vec![Ctap2Error::InvalidLength.status_byte()];
    };
    if cmd != CTAP2_CMD_GET_NEXT_ASSERTION {
        auth.clear_pending();
    }

    let result = match cmd {
        CTAP2_CMD_MAKE_CREDENTIAL => make_credential::handle_make_credential(auth, body, ctx),
        CTAP2_CMD_GET_ASSERTION => get_assertion::handle_get_assertion(auth, body, ctx),
        CTAP2_CMD_GET_INFO => auth.get_info(),
        CTAP2_CMD_CLIENT_PIN => client_pin::handle_client_pin(auth, body),
        CTAP2_CMD_RESET => reset::handle_reset(auth, ctx),
        CTAP2_CMD_GET_NEXT_ASSERTION => get_assertion::handle_get_next_assertion(auth),
        _ => Err(Ctap2Error::InvalidCommand),
    };

    match result {
        Ok(response) => {
            let mut out = Vec::with_capacity(1 + response.len());
            out.push(CTAP2_OK);
            out.extend_from_slice(&response);
            out
        }
        Err(e) => {
            let status = e.status_byte();
            if status == 0x7F {
                tracing::error!(cmd = format!("{cmd:#04x}"), error = %e, "CTAP2 command failed");
            } else {
                tracing::debug!(cmd = format!("{cmd:#04x}"), error = %e, status = format!("{status:#04x}"), "CTAP2 command rejected");
            }
            vec![status]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgorithmMode;
    use authenticator::tests::software_authenticator;

    #[test]
    fn test_empty_payload_is_invalid_length() {
        let dir = tempfile::tempdir().unwrap();
        let auth = software_authenticator(dir.path(), AlgorithmMode::Classical);
        assert_eq!(process(&auth, &[], &CommandContext::new()), vec![0x03]);
    }

    #[test]
    fn test_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let auth = software_authenticator(dir.path(), AlgorithmMode::Classical);
        assert_eq!(process(&auth, &[0x55], &CommandContext::new()), vec![0x01]);
    }

    #[test]
    fn test_get_info_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let auth = software_authenticator(dir.path(), AlgorithmMode::Classical);
        let resp = process(&auth, &[CTAP2_CMD_GET_INFO], &CommandContext::new());
        assert_eq!(resp[0], 0x00);
        assert!(parse_cbor(&resp[1..]).is_ok());
    }

    #[test]
    fn test_cancel_flag_checkpoint() {
        let ctx = CommandContext::new();
        assert!(ctx.check_cancel().is_ok());
        ctx.cancel.store(true, Ordering::Relaxed);
        assert!(matches!(ctx.check_cancel(), Err(Ctap2Error::KeepaliveCancel)));
    }
}
