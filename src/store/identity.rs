use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::backend::{KeyPurpose, KeyReference, KeyStorage, SlotClass};
use crate::crypto::{sha256, PublicKey};

const IDENTITY_KEY: &[u8] = b"device";

/// Created once per device; replaced only by a factory reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub aaguid: [u8; 16],
    pub device_key: KeyReference,
    pub device_public: PublicKey,
    pub attestation_key: KeyReference,
    pub attestation_public: PublicKey,
    /// DER certificate for the attestation key, supplied at startup.
    #[serde(skip)]
    pub certificate: Option<Vec<u8>>,
}

impl DeviceIdentity {
    pub fn load_or_create(backend: &dyn KeyStorage, certificate: Option<Vec<u8>>) -> Result<Self, StoreError> {
        if let Some(bytes) = backend.load_metadata(SlotClass::Identity, IDENTITY_KEY)? {
            let mut identity: Self =
                ciborium::from_reader(bytes.as_slice()).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            identity.certificate = certificate;
            tracing::debug!(aaguid = %uuid_string(&identity.aaguid), "Loaded device identity");
            return Ok(identity);
        }

        let aaguid = match backend.hardware_serial() {
            Some(serial) => derive_aaguid(&serial),
            None => crate::config::DEFAULT_AAGUID,
        };
        let (device_key, device_public) = backend.generate_key(KeyPurpose::DeviceIdentity)?;
        let (attestation_key, attestation_public) = backend.generate_key(KeyPurpose::Attestation)?;
        let identity = Self {
            aaguid,
            device_key,
            device_public,
            attestation_key,
            attestation_public,
            certificate,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&identity, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
        backend.store_metadata(SlotClass::Identity, IDENTITY_KEY, &buf)?;
        tracing::info!(
            target: "audit",
            aaguid = %uuid_string(&aaguid),
            backend = %backend.kind(),
            "Device identity created"
        );
        Ok(identity)
    }
}

/// Stable AAGUID for a chip: a version-4 UUID built from SHA-256 of its serial.
pub fn derive_aaguid(serial: &[u8]) -> [u8; 16] {
    let digest = sha256(&[b"pikey-aaguid", serial]);
    let mut aaguid = [0u8; 16];
    aaguid.copy_from_slice(&digest[..16]);
    aaguid[6] = (aaguid[6] & 0x0F) | 0x40;
    aaguid[8] = (aaguid[8] & 0x3F) | 0x80;
    aaguid
}

pub fn uuid_string(bytes: &[u8; 16]) -> String {
    let digits = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &digits[0..8], &digits[8..12], &digits[12..16], &digits[16..20], &digits[20..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cipher::AesGcmCipher;
    use crate::backend::{FallbackManager, HardwareBackend, SoftwareBackend};
    use crate::se::sim::SimulatedElement;

    #[test]
    fn test_derive_aaguid_is_stable_v4() {
        let a = derive_aaguid(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(a, derive_aaguid(&[1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert_ne!(a, derive_aaguid(&[9, 8, 7, 6, 5, 4, 3, 2, 1]));
        assert_eq!(a[6] >> 4, 4);
        assert_eq!(a[8] & 0xC0, 0x80);
    }

    #[test]
    fn test_uuid_string_format() {
        let s = uuid_string(&[0xAB; 16]);
        assert_eq!(s.len(), 36);
        assert_eq!(&s[8..9], "-");
        assert!(s.starts_with("abababab-abab-"));
    }

    #[test]
    fn test_software_identity_uses_default_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let open = || SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([4u8; 32])), 8, [5u8; 32]).unwrap();
        let first = DeviceIdentity::load_or_create(&open(), None).unwrap();
        assert_eq!(first.aaguid, crate::config::DEFAULT_AAGUID);
        let second = DeviceIdentity::load_or_create(&open(), Some(vec![0x30])).unwrap();
        assert_eq!(second.attestation_key, first.attestation_key);
        assert_eq!(second.certificate, Some(vec![0x30]));
    }

    #[test]
    fn test_hardware_identity_uses_serial() {
        let dir = tempfile::tempdir().unwrap();
        let se = SimulatedElement::with_capacity(6, 4096, 512);
        let hw = HardwareBackend::open(Box::new(se)).unwrap();
        let serial = hw.hardware_serial().unwrap();
        let sw = SoftwareBackend::open(dir.path(), Box::new(AesGcmCipher::new([4u8; 32])), 8, [5u8; 32]).unwrap();
        let manager = FallbackManager::new(Some(hw), sw);
        let identity = DeviceIdentity::load_or_create(&manager, None).unwrap();
        assert_eq!(identity.aaguid, derive_aaguid(&serial));
        assert!(matches!(identity.attestation_key, KeyReference::Hardware(_)));
    }
}
