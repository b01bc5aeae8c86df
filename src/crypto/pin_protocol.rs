//! PIN protocol one: P-256 ECDH, AES-256-CBC with a zero IV and truncated HMAC-SHA-256.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{sha256, CryptoError};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const ZERO_IV: [u8; 16] = [0u8; 16];

/// Authenticator half of the ECDH key agreement. Regenerated per boot and
/// after every PIN mismatch.
pub struct KeyAgreementKey {
    secret: p256::SecretKey,
}

impl KeyAgreementKey {
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self { secret: p256::SecretKey::random(rng) }
    }

    pub fn public_coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        if let (Some(px), Some(py)) = (point.x(), point.y()) {
            x.copy_from_slice(px);
            y.copy_from_slice(py);
        }
        (x, y)
    }

    /// SHA-256 of the ECDH x-coordinate shared with the platform key.
    pub fn shared_secret(&self, peer_x: &[u8; 32], peer_y: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..33].copy_from_slice(peer_x);
        sec1[33..].copy_from_slice(peer_y);
        let peer = p256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(sha256(&[shared.raw_secret_bytes().as_slice()])))
    }
}

/// AES-256-CBC, zero IV, no padding. Input must be block aligned.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if plaintext.len() % 16 != 0 {
        return Err(CryptoError::Cipher(format!("{} bytes is not block aligned", plaintext.len())));
    }
    let mut buffer = plaintext.to_vec();
    let len = buffer.len();
    Aes256CbcEnc::new(key.into(), &ZERO_IV.into())
        .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok(buffer)
}

pub fn decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::Cipher(format!("{} bytes is not block aligned", ciphertext.len())));
    }
    let mut buffer = ciphertext.to_vec();
    Aes256CbcDec::new(key.into(), &ZERO_IV.into())
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;
    Ok(buffer)
}

/// `LEFT(HMAC-SHA-256(key, data), 16)`.
pub fn authenticate(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes()[..16]);
    out
}

/// Constant-time check of a 16-byte `pinAuth` value.
pub fn verify(key: &[u8], data: &[u8], pin_auth: &[u8]) -> bool {
    if pin_auth.len() != 16 {
        return false;
    }
    authenticate(key, data)[..].ct_eq(pin_auth).into()
}

/// `LEFT(SHA-256(pin), 16)`, the form in which a PIN is stored and compared.
pub fn pin_hash(pin: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&sha256(&[pin])[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_both_sides_derive_same_secret() {
        let mut rng = StdRng::seed_from_u64(31);
        let authenticator = KeyAgreementKey::generate(&mut rng);
        let platform = KeyAgreementKey::generate(&mut rng);
        let (ax, ay) = authenticator.public_coordinates();
        let (px, py) = platform.public_coordinates();
        let a = authenticator.shared_secret(&px, &py).unwrap();
        let b = platform.shared_secret(&ax, &ay).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_shared_secret_rejects_invalid_point() {
        let mut rng = StdRng::seed_from_u64(32);
        let key = KeyAgreementKey::generate(&mut rng);
        assert!(matches!(
            key.shared_secret(&[0u8; 32], &[0u8; 32]),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_cbc_roundtrip_and_alignment() {
        let key = [0x42u8; 32];
        let plaintext = [7u8; 64];
        let ct = encrypt(&key, &plaintext).unwrap();
        assert_eq!(ct.len(), 64);
        assert_ne!(ct.as_slice(), plaintext.as_slice());
        assert_eq!(decrypt(&key, &ct).unwrap(), plaintext);

        assert!(encrypt(&key, &[0u8; 15]).is_err());
        assert!(decrypt(&key, &[0u8; 17]).is_err());
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_pin_auth_verification() {
        let key = [1u8; 32];
        let mac = authenticate(&key, b"clientDataHash");
        assert!(verify(&key, b"clientDataHash", &mac));
        assert!(!verify(&key, b"other", &mac));
        assert!(!verify(&key, b"clientDataHash", &mac[..15]));
    }

    #[test]
    fn test_pin_hash_is_left_16_of_sha256() {
        // SHA-256("1234") = 03ac6742 16f3e15c 761ee1a5 e255f067 ...
        assert_eq!(
            pin_hash(b"1234"),
            [
                0x03, 0xac, 0x67, 0x42, 0x16, 0xf3, 0xe1, 0x5c, 0x76, 0x1e, 0xe1, 0xa5, 0xe2, 0x55,
                0xf0, 0x67
            ]
        );
    }
}
