use std::io;
use std::path::PathBuf;

pub mod transport;

pub use transport::{HidTransport, start_hid_transport};

#[derive(Debug, thiserror::Error)]
pub enum HidError {
    #[error("Failed to open HID gadget {0}: {1}")]
    Open(PathBuf, io::Error),
    #[error("HID read error: {0}")]
    Read(io::Error),
    #[error("HID write error: {0}")]
    Write(io::Error),
    #[error("Bad report size: {0} (expected 64)")]
    BadReportSize(usize),
}
