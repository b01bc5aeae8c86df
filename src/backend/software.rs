use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use zeroize::Zeroizing;

use super::cipher::RecordCipher;
use super::{
    BackendError, BackendKind, Health, KeyPurpose, KeyReference, KeyStorage, RecordId,
    SlotClass,
};
use crate::crypto::{self, PublicKey, SecretKey};

const COUNTERS_DIR: &str = "counters";

/// Write `bytes` to `path` so that a crash leaves either the old or the new
/// contents: temp file, fsync, rename, fsync directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Overwrite a file with noise before unlinking it.
fn shred(path: &Path) -> io::Result<()> {
    let len = fs::metadata(path)?.len() as usize;
    let mut noise = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut noise);
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&noise)?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}

fn bin_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("bin") {
            out.push(path);
        }
    }
    Ok(out)
}

struct Inner {
    rng: StdRng,
    issued: HashMap<[u8; 32], u32>,
}

/// Key storage in sealed files under `<root>/{keys,meta/<class>}`.
///
/// Holds every algorithm, including the post-quantum ones the secure element
/// cannot.
pub struct SoftwareBackend {
    root: PathBuf,
    cipher: Box<dyn RecordCipher>,
    max_records: usize,
    inner: Mutex<Inner>,
}

impl SoftwareBackend {
    /// `seed` feeds the CSPRNG used for key generation and hedged signing;
    /// pass hardware randomness when a chip is available.
    pub fn open(
        root: &Path,
        cipher: Box<dyn RecordCipher>,
        max_records: usize,
        seed: [u8; 32],
    ) -> Result<Self, BackendError> {
        fs::create_dir_all(root.join("keys"))?;
        for class in SlotClass::ALL {
            fs::create_dir_all(root.join("meta").join(class.dir_name()))?;
        }
        fs::create_dir_all(root.join("meta").join(COUNTERS_DIR))?;
        tracing::debug!(root = %root.display(), max_records, "Software key store opened");
        Ok(Self {
            root: root.to_path_buf(),
            cipher,
            max_records,
            inner: Mutex::new(Inner { rng: StdRng::from_seed(seed), issued: HashMap::new() }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BackendError> {
        self.inner
            .lock()
            .map_err(|_| BackendError::Unavailable("software store lock poisoned".into()))
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    fn key_path(&self, key: &KeyReference) -> Result<PathBuf, BackendError> {
        match key {
            KeyReference::Software(id) => Ok(self.keys_dir().join(format!("{}.bin", id.hex()))),
            KeyReference::Hardware(_) => Err(BackendError::InvalidReference),
        }
    }

    fn class_dir(&self, class: SlotClass) -> PathBuf {
        self.root.join("meta").join(class.dir_name())
    }

    fn meta_path(&self, class: SlotClass, key: &[u8]) -> PathBuf {
        self.class_dir(class).join(format!("{}.bin", hex::encode(key)))
    }

    fn counter_path(&self, rp_id_hash: &[u8; 32]) -> PathBuf {
        self.root.join("meta").join(COUNTERS_DIR).join(format!("{}.bin", hex::encode(rp_id_hash)))
    }

    fn read_sealed(&self, path: &Path) -> Result<Option<Zeroizing<Vec<u8>>>, BackendError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(Zeroizing::new(self.cipher.open(&bytes)?))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_sealed(&self, path: &Path, plaintext: &[u8]) -> Result<(), BackendError> {
        let sealed = self.cipher.seal(plaintext)?;
        write_atomic(path, &sealed)?;
        Ok(())
    }

    fn stored_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        match self.read_sealed(&self.counter_path(rp_id_hash))? {
            None => Ok(0),
            Some(bytes) => {
                let value: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| BackendError::Corrupt("counter record is not 4 bytes".into()))?;
                Ok(u32::from_be_bytes(value))
            }
        }
    }

    /// Write a counter and read it back before it is handed out.
    fn persist_counter(&self, rp_id_hash: &[u8; 32], value: u32) -> Result<(), BackendError> {
        self.write_sealed(&self.counter_path(rp_id_hash), &value.to_be_bytes())?;
        let stored = self.stored_counter(rp_id_hash)?;
        if stored != value {
            return Err(BackendError::Integrity(format!(
                "counter read back as {stored}, expected {value}"
            )));
        }
        Ok(())
    }

    pub fn record_count(&self) -> Result<usize, BackendError> {
        Ok(bin_files(&self.keys_dir())?.len())
    }
}

impl KeyStorage for SoftwareBackend {
    fn generate_key(&self, purpose: KeyPurpose) -> Result<(KeyReference, PublicKey), BackendError> {
        let mut inner = self.lock()?;
        if self.record_count()? >= self.max_records {
            return Err(BackendError::CapacityExhausted);
        }
        let mut id = [0u8; 16];
        inner.rng.fill_bytes(&mut id);
        let (secret, public) = crypto::generate(purpose.algorithm(), &mut inner.rng)?;

        let mut plaintext = Zeroizing::new(Vec::new());
        ciborium::into_writer(&secret, &mut *plaintext)
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let reference = KeyReference::Software(RecordId(id));
        self.write_sealed(&self.key_path(&reference)?, &plaintext)?;
        tracing::debug!(record = %hex::encode(&id), ?purpose, "Generated software key");
        Ok((reference, public))
    }

    fn sign(&self, key: &KeyReference, digest: &[u8; 32]) -> Result<Vec<u8>, BackendError> {
        let plaintext = self
            .read_sealed(&self.key_path(key)?)?
            .ok_or(BackendError::InvalidReference)?;
        let secret: SecretKey = ciborium::from_reader(plaintext.as_slice())
            .map_err(|e| BackendError::Corrupt(e.to_string()))?;
        let mut inner = self.lock()?;
        Ok(crypto::sign(&secret, digest, &mut inner.rng)?)
    }

    fn secure_delete(&self, key: &KeyReference) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        let _guard = self.lock()?;
        match shred(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::InvalidReference),
            Err(e) => Err(e.into()),
        }
    }

    fn store_metadata(&self, class: SlotClass, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        let _guard = self.lock()?;
        self.write_sealed(&self.meta_path(class, key), value)
    }

    fn load_metadata(&self, class: SlotClass, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.read_sealed(&self.meta_path(class, key))?.map(|v| v.to_vec()))
    }

    fn remove_metadata(&self, class: SlotClass, key: &[u8]) -> Result<(), BackendError> {
        let _guard = self.lock()?;
        match fs::remove_file(self.meta_path(class, key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn list_metadata(&self, class: SlotClass) -> Result<Vec<Vec<u8>>, BackendError> {
        let mut keys = Vec::new();
        for path in bin_files(&self.class_dir(class))? {
            match path.file_stem().and_then(|s| s.to_str()).and_then(|s| hex::decode(s).ok()) {
                Some(key) => keys.push(key),
                None => tracing::warn!(path = %path.display(), "Skipping unrecognized metadata file"),
            }
        }
        Ok(keys)
    }

    fn increment_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        let mut inner = self.lock()?;
        let current = self.stored_counter(rp_id_hash)?;
        if let Some(&issued) = inner.issued.get(rp_id_hash) {
            if current < issued {
                return Err(BackendError::Integrity(format!(
                    "stored counter {current} is below issued value {issued}"
                )));
            }
        }
        let next = current
            .checked_add(1)
            .ok_or_else(|| BackendError::Integrity("counter exhausted".into()))?;
        self.persist_counter(rp_id_hash, next)?;
        inner.issued.insert(*rp_id_hash, next);
        Ok(next)
    }

    fn read_counter(&self, rp_id_hash: &[u8; 32]) -> Result<u32, BackendError> {
        self.stored_counter(rp_id_hash)
    }

    fn raise_counter(&self, rp_id_hash: &[u8; 32], minimum: u32) -> Result<u32, BackendError> {
        let mut inner = self.lock()?;
        let current = self.stored_counter(rp_id_hash)?;
        if current >= minimum {
            return Ok(current);
        }
        self.persist_counter(rp_id_hash, minimum)?;
        let issued = inner.issued.entry(*rp_id_hash).or_insert(minimum);
        *issued = (*issued).max(minimum);
        Ok(minimum)
    }

    fn health_check(&self) -> Health {
        if self.keys_dir().is_dir() && self.lock().is_ok() {
            Health::Healthy
        } else {
            Health::Degraded
        }
    }

    fn get_random(&self, len: usize) -> Result<Vec<u8>, BackendError> {
        let mut out = vec![0u8; len];
        self.lock()?.rng.fill_bytes(&mut out);
        Ok(out)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn wipe_all(&self) -> Result<(), BackendError> {
        let mut inner = self.lock()?;
        for path in bin_files(&self.keys_dir())? {
            shred(&path)?;
        }
        let meta = self.root.join("meta");
        fs::remove_dir_all(&meta)?;
        for class in SlotClass::ALL {
            fs::create_dir_all(meta.join(class.dir_name()))?;
        }
        fs::create_dir_all(meta.join(COUNTERS_DIR))?;
        inner.issued.clear();
        tracing::info!(target: "audit", backend = "software", "All keys and records wiped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cipher::AesGcmCipher;
    use crate::crypto::Algorithm;

    fn backend(dir: &Path, max: usize) -> SoftwareBackend {
        SoftwareBackend::open(dir, Box::new(AesGcmCipher::new([3u8; 32])), max, [4u8; 32]).unwrap()
    }

    #[test]
    fn test_every_algorithm_signs() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 16);
        let digest = [0x5Au8; 32];
        for alg in [
            Algorithm::Es256,
            Algorithm::MlDsa44,
            Algorithm::MlDsa65,
            Algorithm::HybridEs256MlDsa44,
        ] {
            let (key, public) = sw.generate_key(KeyPurpose::Credential(alg)).unwrap();
            let sig = sw.sign(&key, &digest).unwrap();
            assert!(public.verify(&digest, &sig), "{alg}");
        }
    }

    #[test]
    fn test_key_file_is_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 16);
        let (key, _) = sw.generate_key(KeyPurpose::Attestation).unwrap();
        let raw = fs::read(sw.key_path(&key).unwrap()).unwrap();
        assert!(ciborium::from_reader::<SecretKey, _>(raw.as_slice()).is_err());
    }

    #[test]
    fn test_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 2);
        let purpose = KeyPurpose::Credential(Algorithm::Es256);
        let (first, _) = sw.generate_key(purpose).unwrap();
        sw.generate_key(purpose).unwrap();
        assert!(matches!(sw.generate_key(purpose), Err(BackendError::CapacityExhausted)));
        sw.secure_delete(&first).unwrap();
        sw.generate_key(purpose).unwrap();
    }

    #[test]
    fn test_secure_delete_then_sign_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 4);
        let (key, _) = sw.generate_key(KeyPurpose::Credential(Algorithm::MlDsa44)).unwrap();
        sw.secure_delete(&key).unwrap();
        assert!(matches!(sw.sign(&key, &[0u8; 32]), Err(BackendError::InvalidReference)));
        assert!(matches!(sw.secure_delete(&key), Err(BackendError::InvalidReference)));
    }

    #[test]
    fn test_metadata_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 4);
        sw.store_metadata(SlotClass::Credentials, &[0xAB, 0xCD], b"record").unwrap();
        sw.store_metadata(SlotClass::Pin, b"state", b"pin").unwrap();
        assert_eq!(
            sw.load_metadata(SlotClass::Credentials, &[0xAB, 0xCD]).unwrap(),
            Some(b"record".to_vec())
        );
        assert_eq!(sw.list_metadata(SlotClass::Credentials).unwrap(), vec![vec![0xAB, 0xCD]]);
        sw.remove_metadata(SlotClass::Credentials, &[0xAB, 0xCD]).unwrap();
        sw.remove_metadata(SlotClass::Credentials, &[0xAB, 0xCD]).unwrap();
        assert!(sw.list_metadata(SlotClass::Credentials).unwrap().is_empty());
        assert_eq!(sw.load_metadata(SlotClass::Pin, b"state").unwrap(), Some(b"pin".to_vec()));
    }

    #[test]
    fn test_counters_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rp = [0x11u8; 32];
        {
            let sw = backend(dir.path(), 4);
            assert_eq!(sw.increment_counter(&rp).unwrap(), 1);
            assert_eq!(sw.increment_counter(&rp).unwrap(), 2);
        }
        let sw = backend(dir.path(), 4);
        assert_eq!(sw.read_counter(&rp).unwrap(), 2);
        assert_eq!(sw.increment_counter(&rp).unwrap(), 3);
        assert_eq!(sw.raise_counter(&rp, 40).unwrap(), 40);
        assert_eq!(sw.increment_counter(&rp).unwrap(), 41);
        assert!(!dir.path().join("meta/counters").join(format!("{}.tmp", hex::encode(&rp))).exists());
    }

    #[test]
    fn test_counter_rollback_detected() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 4);
        let rp = [0x22u8; 32];
        sw.increment_counter(&rp).unwrap();
        let snapshot = fs::read(sw.counter_path(&rp)).unwrap();
        sw.increment_counter(&rp).unwrap();
        fs::write(sw.counter_path(&rp), snapshot).unwrap();
        assert!(matches!(sw.increment_counter(&rp), Err(BackendError::Integrity(_))));
    }

    #[test]
    fn test_hardware_reference_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 4);
        let foreign = KeyReference::Hardware(crate::backend::SlotHandle(2));
        assert!(matches!(sw.sign(&foreign, &[0u8; 32]), Err(BackendError::InvalidReference)));
    }

    #[test]
    fn test_wipe_all() {
        let dir = tempfile::tempdir().unwrap();
        let sw = backend(dir.path(), 4);
        let (key, _) = sw.generate_key(KeyPurpose::DeviceIdentity).unwrap();
        sw.store_metadata(SlotClass::Identity, b"device", b"x").unwrap();
        sw.increment_counter(&[1u8; 32]).unwrap();
        sw.wipe_all().unwrap();
        assert!(matches!(sw.sign(&key, &[0u8; 32]), Err(BackendError::InvalidReference)));
        assert_eq!(sw.load_metadata(SlotClass::Identity, b"device").unwrap(), None);
        assert_eq!(sw.read_counter(&[1u8; 32]).unwrap(), 0);
        assert_eq!(sw.record_count().unwrap(), 0);
    }
}
