#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HID: {0}")]
    Hid(#[from] crate::hid::HidError),
    #[error("CTAPHID: {0}")]
    CtapHid(#[from] crate::ctaphid::CtapHidError),
    #[error("CTAP2: {0}")]
    Ctap2(#[from] crate::ctap2::types::Ctap2Error),
    #[error("Key storage: {0}")]
    Backend(#[from] crate::backend::BackendError),
    #[error("Secure element: {0}")]
    Se(#[from] crate::se::SeError),
    #[error("Store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("Crypto: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
