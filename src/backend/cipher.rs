use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use super::BackendError;

const NONCE_LEN: usize = 12;

/// At-rest protection for software-backend records.
pub trait RecordCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, BackendError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, BackendError>;
}

/// AES-256-GCM with a random 96-bit nonce prefixed to each record.
pub struct AesGcmCipher {
    key: Zeroizing<[u8; 32]>,
}

impl AesGcmCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key: Zeroizing::new(key) }
    }

    /// Read the key from `path`, creating it (mode 0600) from `seed` on first use.
    pub fn load_or_create(path: &Path, seed: &[u8; 32]) -> Result<Self, BackendError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    BackendError::Corrupt(format!("{} is not a 32-byte key", path.display()))
                })?;
                Ok(Self::new(key))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(path)?;
                file.write_all(seed)?;
                file.sync_all()?;
                tracing::info!(path = %path.display(), "Created software record key");
                Ok(Self::new(*seed))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, BackendError> {
        Aes256Gcm::new_from_slice(self.key.as_slice())
            .map_err(|e| BackendError::Corrupt(e.to_string()))
    }
}

impl RecordCipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, BackendError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, BackendError> {
        if sealed.len() < NONCE_LEN {
            return Err(BackendError::Corrupt("record too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| BackendError::Corrupt("record failed authentication".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_and_tamper() {
        let cipher = AesGcmCipher::new([7u8; 32]);
        let sealed = cipher.seal(b"secret").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 6 + 16);
        assert_eq!(cipher.open(&sealed).unwrap(), b"secret");

        let mut tampered = sealed.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(matches!(cipher.open(&tampered), Err(BackendError::Corrupt(_))));

        let other = AesGcmCipher::new([8u8; 32]);
        assert!(other.open(&sealed).is_err());
        assert!(cipher.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seal.key");
        let first = AesGcmCipher::load_or_create(&path, &[1u8; 32]).unwrap();
        let sealed = first.seal(b"x").unwrap();
        // A second open ignores the new seed and reuses the stored key.
        let second = AesGcmCipher::load_or_create(&path, &[2u8; 32]).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), b"x");
    }
}
