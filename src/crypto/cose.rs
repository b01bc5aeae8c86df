use ciborium::value::Value;

use super::PublicKey;

pub const ALG_ES256: i64 = -7;
pub const ALG_ECDH_ES_HKDF_256: i64 = -25;
pub const ALG_MLDSA44: i64 = -48;
pub const ALG_MLDSA65: i64 = -49;
/// Private-use identifier for the ES256 + ML-DSA-44 composite.
pub const ALG_HYBRID_ES256_MLDSA44: i64 = -65537;

pub const KTY_EC2: i64 = 2;
pub const KTY_AKP: i64 = 7;
pub const CRV_P256: i64 = 1;

/// Private-use COSE key parameter carrying the ML-DSA half of a hybrid key.
pub const PARAM_HYBRID_PQC_KEY: i64 = -70001;

fn int(i: i64) -> Value {
    Value::Integer(i.into())
}

fn ec2_entries(alg: i64, x: &[u8; 32], y: &[u8; 32]) -> Vec<(Value, Value)> {
    vec![
        (int(1), int(KTY_EC2)),
        (int(3), int(alg)),
        (int(-1), int(CRV_P256)),
        (int(-2), Value::Bytes(x.to_vec())),
        (int(-3), Value::Bytes(y.to_vec())),
    ]
}

pub fn public_key_value(key: &PublicKey) -> Value {
    match key {
        PublicKey::Es256 { x, y } => Value::Map(ec2_entries(ALG_ES256, x, y)),
        PublicKey::MlDsa { algorithm, bytes } => Value::Map(vec![
            (int(1), int(KTY_AKP)),
            (int(3), int(algorithm.cose_alg())),
            (int(-1), Value::Bytes(bytes.clone())),
        ]),
        PublicKey::Hybrid { x, y, pqc } => {
            let mut entries = ec2_entries(ALG_HYBRID_ES256_MLDSA44, x, y);
            entries.push((int(PARAM_HYBRID_PQC_KEY), Value::Bytes(pqc.clone())));
            Value::Map(entries)
        }
    }
}

pub fn encode_public_key(key: &PublicKey) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(&public_key_value(key), &mut buf).expect("COSE key encoding is infallible");
    buf
}

/// COSE key for the PIN protocol's ECDH key agreement (alg ECDH-ES+HKDF-256).
pub fn key_agreement_value(x: &[u8; 32], y: &[u8; 32]) -> Value {
    Value::Map(ec2_entries(ALG_ECDH_ES_HKDF_256, x, y))
}

/// Extract P-256 coordinates from a platform COSE key map.
pub fn ec2_coordinates(map: &[(Value, Value)]) -> Option<([u8; 32], [u8; 32])> {
    let get = |key: i64| map.iter().find(|(k, _)| k == &int(key)).map(|(_, v)| v);
    if get(1) != Some(&int(KTY_EC2)) || get(-1) != Some(&int(CRV_P256)) {
        return None;
    }
    let coordinate = |key: i64| -> Option<[u8; 32]> {
        match get(key)? {
            Value::Bytes(b) => b.as_slice().try_into().ok(),
            _ => None,
        }
    };
    Some((coordinate(-2)?, coordinate(-3)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Algorithm;

    fn decode(bytes: &[u8]) -> Vec<(Value, Value)> {
        match ciborium::from_reader(bytes).unwrap() {
            Value::Map(m) => m,
            other => panic!("expected map, got {other:?}"),
        }
    }

    fn lookup(map: &[(Value, Value)], key: i64) -> Option<&Value> {
        map.iter().find(|(k, _)| k == &int(key)).map(|(_, v)| v)
    }

    #[test]
    fn test_ec2_fields() {
        let key = PublicKey::Es256 { x: [0xAA; 32], y: [0xBB; 32] };
        let map = decode(&key.to_cose());
        assert_eq!(lookup(&map, 1), Some(&int(2)), "kty must be EC2");
        assert_eq!(lookup(&map, 3), Some(&int(-7)), "alg must be ES256");
        assert_eq!(lookup(&map, -1), Some(&int(1)), "crv must be P-256");
        assert_eq!(lookup(&map, -2), Some(&Value::Bytes(vec![0xAA; 32])));
        assert_eq!(lookup(&map, -3), Some(&Value::Bytes(vec![0xBB; 32])));
    }

    #[test]
    fn test_mldsa_fields() {
        let key = PublicKey::MlDsa { algorithm: Algorithm::MlDsa65, bytes: vec![1, 2, 3] };
        let map = decode(&key.to_cose());
        assert_eq!(map.len(), 3);
        assert_eq!(lookup(&map, 1), Some(&int(7)));
        assert_eq!(lookup(&map, 3), Some(&int(-49)));
        assert_eq!(lookup(&map, -1), Some(&Value::Bytes(vec![1, 2, 3])));
    }

    #[test]
    fn test_hybrid_fields() {
        let key = PublicKey::Hybrid { x: [1; 32], y: [2; 32], pqc: vec![9; 4] };
        let map = decode(&key.to_cose());
        assert_eq!(lookup(&map, 3), Some(&int(-65537)));
        assert_eq!(lookup(&map, -70001), Some(&Value::Bytes(vec![9; 4])));
        assert_eq!(lookup(&map, -2), Some(&Value::Bytes(vec![1; 32])));
    }

    #[test]
    fn test_ec2_coordinates_roundtrip_and_rejects_wrong_curve() {
        let Value::Map(map) = key_agreement_value(&[3; 32], &[4; 32]) else { unreachable!() };
        assert_eq!(ec2_coordinates(&map), Some(([3; 32], [4; 32])));

        let wrong = vec![(int(1), int(2)), (int(-1), int(2))];
        assert_eq!(ec2_coordinates(&wrong), None);
    }
}
