use ciborium::value::Value;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::authenticator::PinSession;
use super::types::{encode_cbor, ClientPinRequest, Ctap2Error};
use super::Authenticator;
use crate::config::{PIN_MAX_CONSECUTIVE_FAILURES, PIN_RETRIES};
use crate::crypto::{cose, pin_protocol};
use crate::store::PinState;

const SUB_GET_RETRIES: u64 = 0x01;
const SUB_GET_KEY_AGREEMENT: u64 = 0x02;
const SUB_SET_PIN: u64 = 0x03;
const SUB_CHANGE_PIN: u64 = 0x04;
const SUB_GET_PIN_TOKEN: u64 = 0x05;

const NEW_PIN_ENC_LEN: usize = 64;
const MIN_PIN_LEN: usize = 4;

pub(crate) fn handle_client_pin(auth: &Authenticator, body: &[u8]) -> Result<Vec<u8>, Ctap2Error> {
    let req = ClientPinRequest::try_from(body)?;
    if req.pin_protocol != 1 {
        return Err(Ctap2Error::InvalidParameter);
    }
    let mut session = auth.pin_session()?;

    match req.sub_command {
        SUB_GET_RETRIES => {
            let state = auth.pin_state()?;
            encode_cbor(&Value::Map(vec![(
                Value::Integer(3i64.into()),
                Value::Integer(state.retries.into()),
            )]))
        }
        SUB_GET_KEY_AGREEMENT => {
            let (x, y) = session.key_agreement.public_coordinates();
            encode_cbor(&Value::Map(vec![(Value::Integer(1i64.into()), cose::key_agreement_value(&x, &y))]))
        }
        SUB_SET_PIN => {
            let (x, y) = req.key_agreement.ok_or(Ctap2Error::MissingParameter)?;
            let pin_auth = req.pin_auth.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            let new_pin_enc = req.new_pin_enc.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            if auth.pin_state()?.is_set() {
                return Err(Ctap2Error::NotAllowed);
            }
            let shared = session.key_agreement.shared_secret(&x, &y)?;
            if !pin_protocol::verify(&shared[..], new_pin_enc, pin_auth) {
                return Err(Ctap2Error::PinAuthInvalid);
            }
            set_new_pin(auth, &shared, new_pin_enc)?;
            tracing::info!("PIN set");
            Ok(Vec::new())
        }
        SUB_CHANGE_PIN => {
            let (x, y) = req.key_agreement.ok_or(Ctap2Error::MissingParameter)?;
            let pin_auth = req.pin_auth.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            let new_pin_enc = req.new_pin_enc.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            let pin_hash_enc = req.pin_hash_enc.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            let state = auth.pin_state()?;
            if !state.is_set() {
                return Err(Ctap2Error::PinNotSet);
            }
            check_not_blocked(&state, &session)?;
            let shared = session.key_agreement.shared_secret(&x, &y)?;
            let mut covered = new_pin_enc.to_vec();
            covered.extend_from_slice(pin_hash_enc);
            if !pin_protocol::verify(&shared[..], &covered, pin_auth) {
                return Err(Ctap2Error::PinAuthInvalid);
            }
            check_pin_hash(auth, &mut session, &shared, pin_hash_enc)?;
            set_new_pin(auth, &shared, new_pin_enc)?;
            tracing::info!("PIN changed");
            Ok(Vec::new())
        }
        SUB_GET_PIN_TOKEN => {
            let (x, y) = req.key_agreement.ok_or(Ctap2Error::MissingParameter)?;
            let pin_hash_enc = req.pin_hash_enc.as_deref().ok_or(Ctap2Error::MissingParameter)?;
            let state = auth.pin_state()?;
            if !state.is_set() {
                return Err(Ctap2Error::PinNotSet);
            }
            check_not_blocked(&state, &session)?;
            let shared = session.key_agreement.shared_secret(&x, &y)?;
            check_pin_hash(auth, &mut session, &shared, pin_hash_enc)?;
            let token_enc = pin_protocol::encrypt(&shared, &session.pin_token)?;
            encode_cbor(&Value::Map(vec![(Value::Integer(2i64.into()), Value::Bytes(token_enc))]))
        }
        other => {
            tracing::debug!(sub_command = other, "Unknown ClientPIN subcommand");
            Err(Ctap2Error::InvalidParameter)
        }
    }
}

fn check_not_blocked(state: &PinState, session: &PinSession) -> Result<(), Ctap2Error> {
    if state.retries == 0 {
        return Err(Ctap2Error::PinBlocked);
    }
    if session.consecutive_failures >= PIN_MAX_CONSECUTIVE_FAILURES {
        return Err(Ctap2Error::PinAuthBlocked);
    }
    Ok(())
}

/// Compare `pinHashEnc` with the stored hash. The retry counter is charged
/// before the comparison and only refunded on a match.
fn check_pin_hash(
    auth: &Authenticator,
    session: &mut PinSession,
    shared: &[u8; 32],
    pin_hash_enc: &[u8],
) -> Result<(), Ctap2Error> {
    let mut state = auth.pin_state()?;
    state.retries = state.retries.saturating_sub(1);
    auth.store()?.save_pin_state(&state)?;

    let decrypted = Zeroizing::new(pin_protocol::decrypt(shared, pin_hash_enc).unwrap_or_default());
    let matches = match (&state.pin_hash, decrypted.len()) {
        (Some(stored), 16) => bool::from(stored[..].ct_eq(&decrypted[..])),
        _ => false,
    };

    if matches {
        state.retries = PIN_RETRIES;
        auth.store()?.save_pin_state(&state)?;
        session.consecutive_failures = 0;
        return Ok(());
    }

    session.regenerate_key_agreement(auth.backend().as_ref())?;
    session.consecutive_failures = session.consecutive_failures.saturating_add(1);
    tracing::warn!(retries = state.retries, failures = session.consecutive_failures, "PIN mismatch");
    if state.retries == 0 {
        Err(Ctap2Error::PinBlocked)
    } else if session.consecutive_failures >= PIN_MAX_CONSECUTIVE_FAILURES {
        Err(Ctap2Error::PinAuthBlocked)
    } else {
        Err(Ctap2Error::PinInvalid)
    }
}

fn set_new_pin(auth: &Authenticator, shared: &[u8; 32], new_pin_enc: &[u8]) -> Result<(), Ctap2Error> {
    if new_pin_enc.len() != NEW_PIN_ENC_LEN {
        return Err(Ctap2Error::PinPolicyViolation);
    }
    let padded = Zeroizing::new(pin_protocol::decrypt(shared, new_pin_enc)?);
    let len = padded.iter().position(|b| *b == 0).unwrap_or(padded.len());
    if !(MIN_PIN_LEN..NEW_PIN_ENC_LEN).contains(&len) {
        return Err(Ctap2Error::PinPolicyViolation);
    }
    let state = PinState { pin_hash: Some(pin_protocol::pin_hash(&padded[..len])), retries: PIN_RETRIES };
    auth.store()?.save_pin_state(&state)?;
    Ok(())
}
