use std::time::{Duration, Instant};

use ciborium::value::Value;

use super::authenticator::PendingAssertions;
use super::authenticator_data::{FLAG_UP, FLAG_UV};
use super::types::{encode_cbor, Ctap2Error, GetAssertionRequest};
use super::{Authenticator, CommandContext};
use crate::config::NEXT_ASSERTION_WINDOW_SECS;
use crate::crypto::sha256;
use crate::store::{Assertion, CredentialRecord};

pub(crate) fn handle_get_assertion(auth: &Authenticator, body: &[u8], ctx: &CommandContext) -> Result<Vec<u8>, Ctap2Error> {
    let req = GetAssertionRequest::try_from(body)?;
    if req.options.user_verification {
        return Err(Ctap2Error::UnsupportedOption);
    }
    if req.options.user_presence == Some(false) {
        return Err(Ctap2Error::InvalidOption);
    }
    let uv = auth.verify_pin_auth(req.pin_auth.as_deref(), req.pin_protocol, &req.client_data_hash, false)?;

    // 1. Matching credentials. Without an allowList only discoverable ones count.
    let rp_id_hash = sha256(&[req.rp_id.as_bytes()]);
    let matches: Vec<CredentialRecord> = {
        let store = auth.store()?;
        let allowed = (!req.allow_list.is_empty()).then_some(req.allow_list.as_slice());
        store
            .find_credentials(&rp_id_hash, allowed)?
            .filter(|r| allowed.is_some() || r.discoverable)
            .filter(|r| !r.unusable)
            .collect()
    };
    let Some(first) = matches.first() else {
        return Err(Ctap2Error::NoCredentials);
    };

    // 2. User presence
    let prompt = crate::up::get_assertion_prompt(&req.rp_id, first.user_display.as_deref());
    let proof = auth.require_presence(&prompt, ctx)?;

    // 3. Sign
    ctx.check_cancel()?;
    let flags = FLAG_UP | if uv { FLAG_UV } else { 0 };
    let assertion = auth.store()?.assert(first, &req.client_data_hash, flags, &proof)?;
    tracing::info!(rp_id = %req.rp_id, count = matches.len(), sign_count = assertion.sign_counter, "Assertion produced");

    let total = matches.len();
    let response = encode_assertion(first, &assertion, (total > 1).then_some(total), uv)?;

    if total > 1 {
        *auth.pending()? = Some(PendingAssertions {
            rp_id_hash,
            client_data_hash: req.client_data_hash,
            flags,
            remaining: matches[1..].iter().map(|r| r.credential_id.clone()).collect(),
            deadline: Instant::now() + Duration::from_secs(NEXT_ASSERTION_WINDOW_SECS),
            proof,
        });
    }
    Ok(response)
}

/// Serve the next credential of the last multi-match GetAssertion.
pub(crate) fn handle_get_next_assertion(auth: &Authenticator) -> Result<Vec<u8>, Ctap2Error> {
    let mut pending = auth.pending()?;
    let Some(state) = pending.as_mut() else {
        return Err(Ctap2Error::NotAllowed);
    };
    if Instant::now() > state.deadline || state.remaining.is_empty() {
        *pending = None;
        return Err(Ctap2Error::NotAllowed);
    }

    let id = state.remaining.remove(0);
    let mut store = auth.store()?;
    let Some(record) = store.record(&id).cloned() else {
        *pending = None;
        return Err(Ctap2Error::NotAllowed);
    };
    if record.rp_id_hash != state.rp_id_hash {
        *pending = None;
        return Err(Ctap2Error::NotAllowed);
    }
    let assertion = store.assert(&record, &state.client_data_hash, state.flags, &state.proof)?;
    let uv = state.flags & FLAG_UV != 0;
    state.deadline = Instant::now() + Duration::from_secs(NEXT_ASSERTION_WINDOW_SECS);
    if state.remaining.is_empty() {
        *pending = None;
    }
    encode_assertion(&record, &assertion, None, uv)
}

fn encode_assertion(
    record: &CredentialRecord,
    assertion: &Assertion,
    number_of_credentials: Option<usize>,
    uv: bool,
) -> Result<Vec<u8>, Ctap2Error> {
    let mut map = vec![
        (
            Value::Integer(1i64.into()),
            Value::Map(vec![
                (Value::Text("id".to_string()), Value::Bytes(record.credential_id.clone())),
                (Value::Text("type".to_string()), Value::Text("public-key".to_string())),
            ]),
        ),
        (Value::Integer(2i64.into()), Value::Bytes(assertion.auth_data.clone())),
        (Value::Integer(3i64.into()), Value::Bytes(assertion.signature.clone())),
    ];
    if record.discoverable {
        let mut user = vec![(Value::Text("id".to_string()), Value::Bytes(record.user_handle.clone()))];
        // Identifying fields only once the user has been verified.
        if uv {
            if let Some(name) = &record.user_name {
                user.push((Value::Text("name".to_string()), Value::Text(name.clone())));
            }
            if let Some(display) = &record.user_display {
                user.push((Value::Text("displayName".to_string()), Value::Text(display.clone())));
            }
        }
        map.push((Value::Integer(4i64.into()), Value::Map(user)));
    }
    if let Some(n) = number_of_credentials {
        map.push((Value::Integer(5i64.into()), Value::Integer((n as i64).into())));
    }
    encode_cbor(&Value::Map(map))
}
