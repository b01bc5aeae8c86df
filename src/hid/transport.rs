//! Report I/O on the USB gadget's HID character device.
//!
//! The gadget (descriptor, endpoints) is configured before we start; all we
//! see is `/dev/hidgN`, where each read yields one OUT report and each write
//! sends one IN report.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::HidError;
use crate::ctaphid::types::{PACKET_SIZE, Report};

pub struct HidTransport {
    pub incoming_rx: mpsc::Receiver<Report>,
    pub outgoing_tx: mpsc::Sender<Report>,
    pub task: JoinHandle<Result<(), HidError>>,
}

pub fn start_hid_transport(path: &Path) -> Result<HidTransport, HidError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| HidError::Open(path.to_path_buf(), e))?;
    let mut write_file = file.try_clone().map_err(|e| HidError::Open(path.to_path_buf(), e))?;
    tracing::info!(device = %path.display(), "HID gadget opened");

    let (incoming_tx, incoming_rx) = mpsc::channel::<Report>(64);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Report>(64);

    // Writes go out as soon as they are queued; the reader may be parked in a
    // blocking read for as long as the host stays quiet.
    std::thread::spawn(move || {
        while let Some(report) = outgoing_rx.blocking_recv() {
            if let Err(e) = write_file.write_all(&report) {
                tracing::error!("{}", HidError::Write(e));
                break;
            }
            tracing::trace!("HID tx 64 bytes");
        }
        tracing::debug!("HID writer thread exiting");
    });

    let task = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; PACKET_SIZE + 1];
        loop {
            let n = file.read(&mut buf).map_err(HidError::Read)?;
            if n == 0 {
                tracing::info!("HID gadget closed");
                break;
            }
            let report = match normalize_report(&buf[..n]) {
                Ok(report) => report,
                Err(e) => {
                    tracing::debug!("Dropping HID read: {e}");
                    continue;
                }
            };
            if incoming_tx.blocking_send(report).is_err() {
                break;
            }
        }
        Ok(())
    });

    Ok(HidTransport { incoming_rx, outgoing_tx, task })
}

/// Some stacks prepend a zero report-ID byte. Strip it so CTAPHID sees a
/// clean 64-byte frame starting at the CID.
pub fn normalize_report(data: &[u8]) -> Result<Report, HidError> {
    let payload = match data.len() {
        PACKET_SIZE => data,
        n if n == PACKET_SIZE + 1 && data[0] == 0 => &data[1..],
        n => return Err(HidError::BadReportSize(n)),
    };
    let mut report = [0u8; PACKET_SIZE];
    report.copy_from_slice(payload);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_report_passes_through() {
        let data = [0x42u8; 64];
        assert_eq!(normalize_report(&data).unwrap(), data);
    }

    #[test]
    fn test_report_id_prefix_is_stripped() {
        let mut data = [0x11u8; 65];
        data[0] = 0;
        assert_eq!(normalize_report(&data).unwrap(), [0x11u8; 64]);
    }

    #[test]
    fn test_short_report_rejected() {
        assert!(matches!(normalize_report(&[0u8; 10]), Err(HidError::BadReportSize(10))));
        let mut prefixed = [0u8; 65];
        prefixed[0] = 1;
        assert!(matches!(normalize_report(&prefixed), Err(HidError::BadReportSize(65))));
    }

    #[tokio::test]
    async fn test_missing_device_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = start_hid_transport(&dir.path().join("hidg9"));
        assert!(matches!(result, Err(HidError::Open(..))));
    }
}
