pub(crate) const FLAG_UP: u8 = 0x01;
pub(crate) const FLAG_UV: u8 = 0x04;
pub(crate) const FLAG_AT: u8 = 0x40;

/// authenticatorData for MakeCredential: AT is forced on and the attested
/// credential data (aaguid, id, COSE key) follows the counter.
pub(crate) fn build_make_cred_auth_data(
    rp_id_hash: &[u8; 32],
    flags: u8,
    sign_count: u32,
    aaguid: &[u8; 16],
    credential_id: &[u8],
    cose_key: &[u8],
) -> Vec<u8> {
    let cred_id_len = credential_id.len() as u16;
    let mut data = Vec::with_capacity(55 + credential_id.len() + cose_key.len());
    data.extend_from_slice(rp_id_hash);
    data.push(flags | FLAG_AT);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data.extend_from_slice(aaguid);
    data.extend_from_slice(&cred_id_len.to_be_bytes());
    data.extend_from_slice(credential_id);
    data.extend_from_slice(cose_key);
    data
}

/// authenticatorData for GetAssertion (no attested credential data).
pub(crate) fn build_get_assertion_auth_data(rp_id_hash: &[u8; 32], flags: u8, sign_count: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(rp_id_hash);
    data.push(flags & !FLAG_AT);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data
}
