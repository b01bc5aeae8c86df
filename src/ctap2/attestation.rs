use super::types::{encode_cbor, Ctap2Error};
use crate::store::Attestation;
use ciborium::value::Value;

/// Build the "packed" attestation object (fmt, authData, attStmt).
pub(crate) fn build_attestation_object(attestation: &Attestation) -> Result<Vec<u8>, Ctap2Error> {
    let mut statement = vec![
        (
            Value::Text("alg".to_string()),
            Value::Integer(attestation.algorithm.cose_alg().into()),
        ),
        (
            Value::Text("sig".to_string()),
            Value::Bytes(attestation.signature.clone()),
        ),
    ];
    if let Some(cert) = &attestation.certificate {
        statement.push((
            Value::Text("x5c".to_string()),
            Value::Array(vec![Value::Bytes(cert.clone())]),
        ));
    }
    let map = Value::Map(vec![
        (Value::Integer(1i64.into()), Value::Text("packed".to_string())),
        (Value::Integer(2i64.into()), Value::Bytes(attestation.auth_data.clone())),
        (Value::Integer(3i64.into()), Value::Map(statement)),
    ]);
    encode_cbor(&map)
}
