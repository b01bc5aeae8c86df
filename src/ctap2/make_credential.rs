use super::attestation::build_attestation_object;
use super::authenticator_data::{FLAG_UP, FLAG_UV};
use super::types::{Ctap2Error, MakeCredentialRequest, RequestOptions};
use super::{Authenticator, CommandContext};
use crate::crypto::{sha256, Algorithm};
use crate::store::CredentialRequest;

pub(crate) fn handle_make_credential(auth: &Authenticator, body: &[u8], ctx: &CommandContext) -> Result<Vec<u8>, Ctap2Error> {
    let req = MakeCredentialRequest::try_from(body)?;
    check_options(&req.options)?;

    // 1. PIN
    let uv = auth.verify_pin_auth(req.pin_auth.as_deref(), req.pin_protocol, &req.client_data_hash, true)?;

    // 2. Algorithm: first RP choice the configured mode accepts
    let algorithm = req
        .algorithms
        .iter()
        .filter_map(|alg| Algorithm::from_cose(*alg))
        .find(|alg| auth.mode().accepts(*alg))
        .ok_or(Ctap2Error::UnsupportedAlgorithm)?;

    // 3. excludeList
    let rp_id_hash = sha256(&[req.rp_id.as_bytes()]);
    if !req.exclude_list.is_empty() {
        let store = auth.store()?;
        if store.find_credentials(&rp_id_hash, Some(&req.exclude_list))?.next().is_some() {
            return Err(Ctap2Error::CredentialExcluded);
        }
    }

    // 4. User presence
    let prompt = crate::up::make_credential_prompt(&req.rp_id, req.rp_name.as_deref(), req.user_display.as_deref());
    let proof = auth.require_presence(&prompt, ctx)?;
    tracing::info!(rp_id = %req.rp_id, %algorithm, "User presence confirmed");

    // 5. Key generation and record
    ctx.check_cancel()?;
    let request = CredentialRequest {
        rp_id: &req.rp_id,
        user_handle: &req.user_id,
        user_name: req.user_name.as_deref(),
        user_display: req.user_display.as_deref(),
        algorithm,
        discoverable: req.options.resident_key,
        exclusive: false,
    };
    let mut store = auth.store()?;
    let record = store.create_credential(&request, &proof)?;

    // 6. Attestation
    let flags = FLAG_UP | if uv { FLAG_UV } else { 0 };
    let attestation = store.attest(&record, &req.client_data_hash, flags)?;
    build_attestation_object(&attestation)
}

fn check_options(options: &RequestOptions) -> Result<(), Ctap2Error> {
    if options.user_verification {
        return Err(Ctap2Error::UnsupportedOption);
    }
    if options.user_presence == Some(false) {
        return Err(Ctap2Error::InvalidOption);
    }
    Ok(())
}
