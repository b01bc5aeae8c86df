use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use super::{poll_until, UpPrompt, UserPresence, UserPresenceProof};
use crate::ctap2::types::Ctap2Error;

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// Active-low push button read through a sysfs GPIO value file.
pub struct GpioButton {
    value_path: PathBuf,
}

impl GpioButton {
    /// Export `gpio` as an input if the kernel has not done so yet.
    pub fn open(gpio: u32) -> std::io::Result<Self> {
        let dir = Path::new(SYSFS_GPIO).join(format!("gpio{gpio}"));
        if !dir.exists() {
            std::fs::write(Path::new(SYSFS_GPIO).join("export"), gpio.to_string())?;
            // udev needs a moment to fix permissions on the new node.
            std::thread::sleep(Duration::from_millis(100));
        }
        std::fs::write(dir.join("direction"), "in")?;
        tracing::info!(gpio, "Presence button ready");
        Ok(Self::with_value_file(dir.join("value")))
    }

    pub fn with_value_file(value_path: PathBuf) -> Self {
        Self { value_path }
    }

    fn pressed(&self) -> Result<bool, Ctap2Error> {
        let raw = std::fs::read_to_string(&self.value_path)
            .map_err(|e| Ctap2Error::Other(format!("button: {e}")))?;
        Ok(raw.trim() == "0")
    }
}

impl UserPresence for GpioButton {
    fn confirm(&self, prompt: &UpPrompt, cancel: &AtomicBool, timeout: Duration) -> Result<UserPresenceProof, Ctap2Error> {
        tracing::info!(prompt = %prompt.description, "Waiting for button press");
        poll_until(cancel, timeout, || self.pressed())
    }
}
