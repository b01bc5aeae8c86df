use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ciborium::value::Value;
use rand::rngs::StdRng;
use rand::SeedableRng;
use zeroize::Zeroizing;

use super::types::{encode_cbor, Ctap2Error};
use super::CommandContext;
use crate::backend::{BackendState, FallbackManager, KeyStorage};
use crate::config::AlgorithmMode;
use crate::crypto::pin_protocol::KeyAgreementKey;
use crate::crypto::cose;
use crate::ctaphid::types::{KEEPALIVE_STATUS_PROCESSING, KEEPALIVE_STATUS_UPNEEDED};
use crate::store::{CredentialStore, PinState};
use crate::up::{UpPrompt, UserPresence, UserPresenceProof};

/// Per-boot ClientPIN secrets. Never persisted.
pub(crate) struct PinSession {
    pub key_agreement: KeyAgreementKey,
    pub pin_token: Zeroizing<Vec<u8>>,
    pub consecutive_failures: u8,
}

impl PinSession {
    fn new(backend: &dyn KeyStorage) -> Result<Self, Ctap2Error> {
        Ok(Self {
            key_agreement: KeyAgreementKey::generate(&mut seeded_rng(backend)?),
            pin_token: Zeroizing::new(backend.get_random(32)?),
            consecutive_failures: 0,
        })
    }

    pub(crate) fn regenerate_key_agreement(&mut self, backend: &dyn KeyStorage) -> Result<(), Ctap2Error> {
        self.key_agreement = KeyAgreementKey::generate(&mut seeded_rng(backend)?);
        Ok(())
    }
}

/// Credentials left over from a GetAssertion with several matches.
pub(crate) struct PendingAssertions {
    pub rp_id_hash: [u8; 32],
    pub client_data_hash: Vec<u8>,
    pub flags: u8,
    pub remaining: Vec<Vec<u8>>,
    pub deadline: Instant,
    pub proof: UserPresenceProof,
}

pub struct Authenticator {
    store: Mutex<CredentialStore>,
    backend: Arc<FallbackManager>,
    presence: Box<dyn UserPresence>,
    mode: AlgorithmMode,
    presence_timeout: Duration,
    pin: Mutex<PinSession>,
    pending: Mutex<Option<PendingAssertions>>,
}

impl Authenticator {
    pub fn new(
        store: CredentialStore,
        backend: Arc<FallbackManager>,
        presence: Box<dyn UserPresence>,
        mode: AlgorithmMode,
        presence_timeout: Duration,
    ) -> Result<Self, Ctap2Error> {
        let pin = PinSession::new(backend.as_ref())?;
        Ok(Self {
            store: Mutex::new(store),
            backend,
            presence,
            mode,
            presence_timeout,
            pin: Mutex::new(pin),
            pending: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> AlgorithmMode {
        self.mode
    }

    pub fn backend(&self) -> &Arc<FallbackManager> {
        &self.backend
    }

    pub(crate) fn store(&self) -> Result<MutexGuard<'_, CredentialStore>, Ctap2Error> {
        self.store.lock().map_err(|_| Ctap2Error::Other("credential store lock poisoned".into()))
    }

    pub(crate) fn pin_session(&self) -> Result<MutexGuard<'_, PinSession>, Ctap2Error> {
        self.pin.lock().map_err(|_| Ctap2Error::Other("PIN session lock poisoned".into()))
    }

    pub(crate) fn pending(&self) -> Result<MutexGuard<'_, Option<PendingAssertions>>, Ctap2Error> {
        self.pending.lock().map_err(|_| Ctap2Error::Other("pending assertions lock poisoned".into()))
    }

    pub(crate) fn clear_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    pub(crate) fn pin_state(&self) -> Result<PinState, Ctap2Error> {
        Ok(self.store()?.pin_state()?)
    }

    /// Ask the user, with keepalive reporting UPNEEDED while waiting.
    pub(crate) fn require_presence(&self, prompt: &UpPrompt, ctx: &CommandContext) -> Result<UserPresenceProof, Ctap2Error> {
        ctx.check_cancel()?;
        ctx.keepalive.store(KEEPALIVE_STATUS_UPNEEDED, Ordering::Relaxed);
        let result = self.presence.confirm(prompt, &ctx.cancel, self.presence_timeout);
        ctx.keepalive.store(KEEPALIVE_STATUS_PROCESSING, Ordering::Relaxed);
        if let Err(e) = &result {
            tracing::info!(error = %e, "User presence not confirmed");
        }
        result
    }

    /// Check `pinAuth` against the per-boot PIN token. Returns whether the
    /// UV flag may be set.
    pub(crate) fn verify_pin_auth(
        &self,
        pin_auth: Option<&[u8]>,
        pin_protocol: Option<u64>,
        client_data_hash: &[u8],
        required_when_set: bool,
    ) -> Result<bool, Ctap2Error> {
        let pin_set = self.pin_state()?.is_set();
        let Some(pin_auth) = pin_auth else {
            if pin_set && required_when_set {
                return Err(Ctap2Error::PinRequired);
            }
            return Ok(false);
        };
        // A zero-length pinAuth asks whether a PIN is set.
        if pin_auth.is_empty() {
            return Err(if pin_set { Ctap2Error::PinInvalid } else { Ctap2Error::PinNotSet });
        }
        match pin_protocol {
            Some(1) => {}
            Some(_) => return Err(Ctap2Error::InvalidParameter),
            None => return Err(Ctap2Error::MissingParameter),
        }
        if !pin_set {
            return Err(Ctap2Error::PinNotSet);
        }
        let session = self.pin_session()?;
        if crate::crypto::pin_protocol::verify(&session.pin_token, client_data_hash, pin_auth) {
            Ok(true)
        } else {
            Err(Ctap2Error::PinAuthInvalid)
        }
    }

    pub(crate) fn get_info(&self) -> Result<Vec<u8>, Ctap2Error> {
        let aaguid = self.store()?.identity().aaguid;
        let pin_set = self.pin_state()?.is_set();
        super::get_info::handle_get_info(&aaguid, self.mode, pin_set)
    }

    /// Vendor STATUS payload: backend state, credential count, identity and
    /// any pending degradation warning.
    pub fn status_report(&self) -> Result<Vec<u8>, Ctap2Error> {
        let store = self.store()?;
        let identity = store.identity();
        let state = match self.backend.state() {
            BackendState::HardwareActive => "hardware",
            BackendState::SoftwareActive => "software",
        };
        let mut map = vec![
            (Value::Integer(1i64.into()), Value::Text(state.to_string())),
            (Value::Integer(2i64.into()), Value::Integer((store.credential_count() as i64).into())),
            (Value::Integer(3i64.into()), Value::Bytes(identity.aaguid.to_vec())),
            (Value::Integer(4i64.into()), cose::public_key_value(&identity.device_public)),
            (Value::Integer(5i64.into()), Value::Text(format!("{:?}", self.mode).to_lowercase())),
        ];
        if let Some(warning) = self.backend.take_warning() {
            map.push((Value::Integer(6i64.into()), Value::Text(warning)));
        }
        encode_cbor(&Value::Map(map))
    }
}

/// CSPRNG seeded from the active key-storage backend (chip RNG on hardware).
pub(crate) fn seeded_rng(backend: &dyn KeyStorage) -> Result<StdRng, Ctap2Error> {
    let seed: [u8; 32] = backend
        .get_random(32)?
        .try_into()
        .map_err(|_| Ctap2Error::Other("short random seed".into()))?;
    Ok(StdRng::from_seed(seed))
}
