use ciborium::value::Value;

use crate::backend::BackendError;
use crate::crypto::cose;
use crate::store::StoreError;

pub const CTAP2_CMD_MAKE_CREDENTIAL:     u8 = 0x01;
pub const CTAP2_CMD_GET_ASSERTION:       u8 = 0x02;
pub const CTAP2_CMD_GET_INFO:            u8 = 0x04;
pub const CTAP2_CMD_CLIENT_PIN:          u8 = 0x06;
pub const CTAP2_CMD_RESET:               u8 = 0x07;
pub const CTAP2_CMD_GET_NEXT_ASSERTION:  u8 = 0x08;

pub const CTAP2_OK: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum Ctap2Error {
    #[error("invalid command")]          InvalidCommand,
    #[error("invalid parameter")]        InvalidParameter,
    #[error("invalid length")]           InvalidLength,
    #[error("unexpected CBOR type")]     UnexpectedType,
    #[error("invalid CBOR: {0}")]        InvalidCbor(String),
    #[error("missing parameter")]        MissingParameter,
    #[error("credential excluded")]      CredentialExcluded,
    #[error("unsupported algorithm")]    UnsupportedAlgorithm,
    #[error("operation denied")]         OperationDenied,
    #[error("key store full")]           KeyStoreFull,
    #[error("unsupported option")]       UnsupportedOption,
    #[error("invalid option")]           InvalidOption,
    #[error("keepalive cancel")]         KeepaliveCancel,
    #[error("no credentials")]           NoCredentials,
    #[error("user action timeout")]      UserActionTimeout,
    #[error("not allowed")]              NotAllowed,
    #[error("PIN invalid")]              PinInvalid,
    #[error("PIN blocked")]              PinBlocked,
    #[error("PIN auth invalid")]         PinAuthInvalid,
    #[error("PIN auth blocked")]         PinAuthBlocked,
    #[error("PIN not set")]              PinNotSet,
    #[error("PIN required")]             PinRequired,
    #[error("PIN policy violation")]     PinPolicyViolation,
    #[error("store: {0}")]               Store(#[from] StoreError),
    #[error("backend: {0}")]             Backend(#[from] BackendError),
    #[error("crypto: {0}")]              Crypto(#[from] crate::crypto::CryptoError),
    #[error("{0}")]                      Other(String),
}

impl Ctap2Error {
    pub fn status_byte(&self) -> u8 {
        match self {
            Self::InvalidCommand       => 0x01,
            Self::InvalidParameter     => 0x02,
            Self::InvalidLength        => 0x03,
            Self::UnexpectedType       => 0x11,
            Self::InvalidCbor(_)       => 0x12,
            Self::MissingParameter     => 0x14,
            Self::CredentialExcluded   => 0x19,
            Self::UnsupportedAlgorithm => 0x26,
            Self::OperationDenied      => 0x27,
            Self::KeyStoreFull         => 0x28,
            Self::UnsupportedOption    => 0x2B,
            Self::InvalidOption        => 0x2C,
            Self::KeepaliveCancel      => 0x2D,
            Self::NoCredentials        => 0x2E,
            Self::UserActionTimeout    => 0x2F,
            Self::NotAllowed           => 0x30,
            Self::PinInvalid           => 0x31,
            Self::PinBlocked           => 0x32,
            Self::PinAuthInvalid       => 0x33,
            Self::PinAuthBlocked       => 0x34,
            Self::PinNotSet            => 0x35,
            Self::PinRequired          => 0x36,
            Self::PinPolicyViolation   => 0x37,
            Self::Store(e)             => store_status(e),
            Self::Backend(e)           => backend_status(e),
            Self::Crypto(_) | Self::Other(_) => 0x7F,
        }
    }
}

fn store_status(e: &StoreError) -> u8 {
    match e {
        StoreError::DuplicateCredential => 0x19,
        StoreError::NotFound => 0x2E,
        StoreError::Backend(b) => backend_status(b),
        _ => 0x7F,
    }
}

fn backend_status(e: &BackendError) -> u8 {
    match e {
        BackendError::CapacityExhausted => 0x28,
        BackendError::Unsupported(_) => 0x26,
        _ => 0x7F,
    }
}

/// Option flags shared by MakeCredential and GetAssertion (key 7 / key 5).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestOptions {
    pub resident_key:      bool,
    pub user_presence:     Option<bool>,
    pub user_verification: bool,
}

#[derive(Debug)]
pub(crate) struct MakeCredentialRequest {
    pub client_data_hash: Vec<u8>,
    pub rp_id:            String,
    pub rp_name:          Option<String>,
    pub user_id:          Vec<u8>,
    pub user_name:        Option<String>,
    pub user_display:     Option<String>,
    /// COSE algorithm ids from pubKeyCredParams, in RP preference order.
    pub algorithms:       Vec<i64>,
    pub exclude_list:     Vec<Vec<u8>>,
    pub options:          RequestOptions,
    pub pin_auth:         Option<Vec<u8>>,
    pub pin_protocol:     Option<u64>,
}

#[derive(Debug)]
pub(crate) struct GetAssertionRequest {
    pub rp_id:            String,
    pub client_data_hash: Vec<u8>,
    pub allow_list:       Vec<Vec<u8>>,
    pub options:          RequestOptions,
    pub pin_auth:         Option<Vec<u8>>,
    pub pin_protocol:     Option<u64>,
}

#[derive(Debug)]
pub(crate) struct ClientPinRequest {
    pub pin_protocol:  u64,
    pub sub_command:   u64,
    pub key_agreement: Option<([u8; 32], [u8; 32])>,
    pub pin_auth:      Option<Vec<u8>>,
    pub new_pin_enc:   Option<Vec<u8>>,
    pub pin_hash_enc:  Option<Vec<u8>>,
}

// CBOR parsing helpers

pub(crate) fn parse_cbor(data: &[u8]) -> Result<Vec<(Value, Value)>, Ctap2Error> {
    let value: Value = ciborium::from_reader(data)
        .map_err(|e| Ctap2Error::InvalidCbor(e.to_string()))?;
    match value {
        Value::Map(map) => Ok(map),
        _ => Err(Ctap2Error::UnexpectedType),
    }
}

pub(crate) fn encode_cbor(value: &Value) -> Result<Vec<u8>, Ctap2Error> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| Ctap2Error::Other(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn cbor_get<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    let target = Value::Integer(key.into());
    map.iter().find(|(k, _)| k == &target).map(|(_, v)| v)
}

pub(crate) fn cbor_get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(s) if s == key))
        .map(|(_, v)| v)
}

pub(crate) fn cbor_bytes(v: &Value) -> Option<&[u8]> {
    match v { Value::Bytes(b) => Some(b), _ => None }
}

pub(crate) fn cbor_text(v: &Value) -> Option<&str> {
    match v { Value::Text(s) => Some(s), _ => None }
}

pub(crate) fn cbor_bool(v: &Value) -> Option<bool> {
    match v { Value::Bool(b) => Some(*b), _ => None }
}

pub(crate) fn cbor_map(v: &Value) -> Option<&[(Value, Value)]> {
    match v { Value::Map(m) => Some(m), _ => None }
}

pub(crate) fn cbor_array(v: &Value) -> Option<&[Value]> {
    match v { Value::Array(a) => Some(a), _ => None }
}

pub(crate) fn cbor_int(v: &Value) -> Option<i64> {
    match v { Value::Integer(i) => i64::try_from(i128::from(*i)).ok(), _ => None }
}

/// Required entry of the expected type. Absent → MissingParameter, wrong
/// type → UnexpectedType.
fn required<'a, T>(
    entry: Option<&'a Value>,
    convert: impl FnOnce(&'a Value) -> Option<T>,
) -> Result<T, Ctap2Error> {
    convert(entry.ok_or(Ctap2Error::MissingParameter)?).ok_or(Ctap2Error::UnexpectedType)
}

fn optional<'a, T>(
    entry: Option<&'a Value>,
    convert: impl FnOnce(&'a Value) -> Option<T>,
) -> Result<Option<T>, Ctap2Error> {
    entry.map(|v| convert(v).ok_or(Ctap2Error::UnexpectedType)).transpose()
}

fn descriptor_ids(entry: Option<&Value>) -> Result<Vec<Vec<u8>>, Ctap2Error> {
    let Some(list) = optional(entry, cbor_array)? else {
        return Ok(vec![]);
    };
    list.iter()
        .map(|item| -> Result<Vec<u8>, Ctap2Error> {
            let m = cbor_map(item).ok_or(Ctap2Error::UnexpectedType)?;
            Ok(required(cbor_get_str(m, "id"), cbor_bytes)?.to_vec())
        })
        .collect()
}

fn parse_options(entry: Option<&Value>) -> Result<RequestOptions, Ctap2Error> {
    let Some(map) = optional(entry, cbor_map)? else {
        return Ok(RequestOptions::default());
    };
    Ok(RequestOptions {
        resident_key:      optional(cbor_get_str(map, "rk"), cbor_bool)?.unwrap_or(false),
        user_presence:     optional(cbor_get_str(map, "up"), cbor_bool)?,
        user_verification: optional(cbor_get_str(map, "uv"), cbor_bool)?.unwrap_or(false),
    })
}

fn parse_protocol(entry: Option<&Value>) -> Result<Option<u64>, Ctap2Error> {
    optional(entry, |v| cbor_int(v).and_then(|i| u64::try_from(i).ok()))
}

impl TryFrom<&[u8]> for MakeCredentialRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = parse_cbor(data)?;

        // 1: clientDataHash
        let client_data_hash = required(cbor_get(&map, 1), cbor_bytes)?.to_vec();

        // 2: rp
        let rp_map = required(cbor_get(&map, 2), cbor_map)?;
        let rp_id = required(cbor_get_str(rp_map, "id"), cbor_text)?.to_string();
        let rp_name = cbor_get_str(rp_map, "name").and_then(cbor_text).map(|s| s.to_string());

        // 3: user
        let user_map = required(cbor_get(&map, 3), cbor_map)?;
        let user_id = required(cbor_get_str(user_map, "id"), cbor_bytes)?.to_vec();
        let user_name = cbor_get_str(user_map, "name").and_then(cbor_text).map(|s| s.to_string());
        let user_display = cbor_get_str(user_map, "displayName").and_then(cbor_text).map(|s| s.to_string());

        // 4: pubKeyCredParams; entries of other credential types are skipped
        let params = required(cbor_get(&map, 4), cbor_array)?;
        let mut algorithms = Vec::with_capacity(params.len());
        for item in params {
            let m = cbor_map(item).ok_or(Ctap2Error::UnexpectedType)?;
            let alg = required(cbor_get_str(m, "alg"), cbor_int)?;
            let kind = optional(cbor_get_str(m, "type"), cbor_text)?;
            if kind.map_or(true, |t| t == "public-key") {
                algorithms.push(alg);
            }
        }

        // 5: excludeList
        let exclude_list = descriptor_ids(cbor_get(&map, 5))?;

        // 7: options
        let options = parse_options(cbor_get(&map, 7))?;

        // 8, 9: pinAuth, pinProtocol
        let pin_auth = optional(cbor_get(&map, 8), cbor_bytes)?.map(<[u8]>::to_vec);
        let pin_protocol = parse_protocol(cbor_get(&map, 9))?;

        Ok(MakeCredentialRequest {
            client_data_hash,
            rp_id,
            rp_name,
            user_id,
            user_name,
            user_display,
            algorithms,
            exclude_list,
            options,
            pin_auth,
            pin_protocol,
        })
    }
}

impl TryFrom<&[u8]> for GetAssertionRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = parse_cbor(data)?;

        // 1: rpId
        let rp_id = required(cbor_get(&map, 1), cbor_text)?.to_string();

        // 2: clientDataHash
        let client_data_hash = required(cbor_get(&map, 2), cbor_bytes)?.to_vec();

        // 3: allowList (optional)
        let allow_list = descriptor_ids(cbor_get(&map, 3))?;

        // 5: options
        let options = parse_options(cbor_get(&map, 5))?;

        // 6, 7: pinAuth, pinProtocol
        let pin_auth = optional(cbor_get(&map, 6), cbor_bytes)?.map(<[u8]>::to_vec);
        let pin_protocol = parse_protocol(cbor_get(&map, 7))?;

        Ok(GetAssertionRequest { rp_id, client_data_hash, allow_list, options, pin_auth, pin_protocol })
    }
}

impl TryFrom<&[u8]> for ClientPinRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = parse_cbor(data)?;
        let pin_protocol = parse_protocol(cbor_get(&map, 1))?.ok_or(Ctap2Error::MissingParameter)?;
        let sub_command = parse_protocol(cbor_get(&map, 2))?.ok_or(Ctap2Error::MissingParameter)?;
        let key_agreement = match optional(cbor_get(&map, 3), cbor_map)? {
            Some(key) => Some(cose::ec2_coordinates(key).ok_or(Ctap2Error::InvalidParameter)?),
            None => None,
        };
        let pin_auth = optional(cbor_get(&map, 4), cbor_bytes)?.map(<[u8]>::to_vec);
        let new_pin_enc = optional(cbor_get(&map, 5), cbor_bytes)?.map(<[u8]>::to_vec);
        let pin_hash_enc = optional(cbor_get(&map, 6), cbor_bytes)?.map(<[u8]>::to_vec);
        Ok(ClientPinRequest { pin_protocol, sub_command, key_agreement, pin_auth, new_pin_enc, pin_hash_enc })
    }
}
