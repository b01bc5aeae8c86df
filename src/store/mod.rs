pub mod credential;
pub mod identity;
pub mod index;
pub mod pin;

pub use credential::CredentialRecord;
pub use identity::DeviceIdentity;
pub use index::{Assertion, Attestation, CredentialRequest, CredentialStore, Credentials};
pub use pin::PinState;

use crate::backend::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("a credential for this user already exists")]
    DuplicateCredential,
    #[error("Not found")]
    NotFound,
    #[error("credential key no longer exists")]
    ReferenceInvalid,
    #[error("credential disabled after a counter integrity failure")]
    Unusable,
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
    #[error("Serialize: {0}")]
    Serialization(String),
    #[error("Corrupt: {0}")]
    Corrupt(String),
}
