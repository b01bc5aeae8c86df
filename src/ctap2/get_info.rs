use ciborium::value::Value;

use super::types::{encode_cbor, Ctap2Error};
use crate::config::{AlgorithmMode, MAX_CREDENTIAL_COUNT_IN_LIST, MAX_CREDENTIAL_ID_LENGTH, MAX_MSG_SIZE};

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// CBOR body of the GetInfo response.
pub(crate) fn handle_get_info(aaguid: &[u8; 16], mode: AlgorithmMode, pin_set: bool) -> Result<Vec<u8>, Ctap2Error> {
    let algorithms = mode
        .supported()
        .iter()
        .map(|alg| {
            Value::Map(vec![
                (text("alg"), Value::Integer(alg.cose_alg().into())),
                (text("type"), text("public-key")),
            ])
        })
        .collect();
    let map = Value::Map(vec![
        (
            Value::Integer(1i64.into()),
            Value::Array(vec![text("FIDO_2_0"), text("FIDO_2_1_PRE")]),
        ),
        (Value::Integer(2i64.into()), Value::Array(vec![])),
        (Value::Integer(3i64.into()), Value::Bytes(aaguid.to_vec())),
        (
            Value::Integer(4i64.into()),
            Value::Map(vec![
                (text("rk"), Value::Bool(true)),
                (text("up"), Value::Bool(true)),
                (text("plat"), Value::Bool(false)),
                (text("clientPin"), Value::Bool(pin_set)),
            ]),
        ),
        (Value::Integer(5i64.into()), Value::Integer((MAX_MSG_SIZE as i64).into())),
        (Value::Integer(6i64.into()), Value::Array(vec![Value::Integer(1i64.into())])),
        (Value::Integer(7i64.into()), Value::Integer((MAX_CREDENTIAL_COUNT_IN_LIST as i64).into())),
        (Value::Integer(8i64.into()), Value::Integer((MAX_CREDENTIAL_ID_LENGTH as i64).into())),
        (Value::Integer(9i64.into()), Value::Array(vec![text("usb")])),
        (Value::Integer(10i64.into()), Value::Array(algorithms)),
    ]);
    encode_cbor(&map)
}
