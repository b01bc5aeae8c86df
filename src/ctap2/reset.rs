use super::types::Ctap2Error;
use super::{Authenticator, CommandContext};

/// Wipe every credential and the PIN after the user confirms. The device
/// identity and AAGUID survive.
pub(crate) fn handle_reset(auth: &Authenticator, ctx: &CommandContext) -> Result<Vec<u8>, Ctap2Error> {
    auth.require_presence(&crate::up::reset_prompt(), ctx)?;
    ctx.check_cancel()?;

    let removed = auth.store()?.reset()?;
    {
        let mut session = auth.pin_session()?;
        session.consecutive_failures = 0;
        session.regenerate_key_agreement(auth.backend().as_ref())?;
    }
    auth.clear_pending();
    tracing::info!(removed, "Reset complete");
    Ok(Vec::new())
}
