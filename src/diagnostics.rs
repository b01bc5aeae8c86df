use std::path::Path;

use crate::config::{BackendChoice, Config, PresenceMode};

/// Preflight checks that turn common setup mistakes into actionable errors
/// before any device is touched for real.
pub fn check(cfg: &Config) -> anyhow::Result<()> {
    let mut errors: Vec<String> = Vec::new();

    // HID gadget node readable and writable
    if let Err(e) = std::fs::OpenOptions::new().read(true).write(true).open(&cfg.hid_device) {
        errors.push(format!(
            "cannot open {}: {e}\n  \
             → is the USB HID gadget configured (configfs functions/hid.usb0)?\n  \
             → the service user needs rw access to the node",
            cfg.hid_device.display()
        ));
    }

    // I2C bus for the secure element
    match cfg.backend {
        BackendChoice::Software => {}
        BackendChoice::Hardware => {
            if let Some(err) = i2c_problem(&cfg.i2c_bus) {
                errors.push(err);
            }
        }
        BackendChoice::Auto => {
            if let Some(err) = i2c_problem(&cfg.i2c_bus) {
                tracing::warn!("{err}\n  → continuing with software key storage");
            }
        }
    }

    match cfg.presence {
        PresenceMode::Pinentry => {
            if let Err(e) = std::process::Command::new(&cfg.pinentry).arg("--version").output() {
                errors.push(format!(
                    "pinentry binary not found: '{}': {e}\n  \
                     → install a pinentry flavour or pass --pinentry",
                    cfg.pinentry
                ));
            }
        }
        PresenceMode::Button => {
            if !Path::new("/sys/class/gpio").exists() {
                errors.push(
                    "/sys/class/gpio is missing\n  \
                     → enable CONFIG_GPIO_SYSFS or use --presence pinentry"
                        .to_string(),
                );
            }
        }
        PresenceMode::Auto => {}
    }

    if let Some(cert) = &cfg.attestation_cert {
        if !cert.is_file() {
            errors.push(format!("attestation certificate {} not found", cert.display()));
        }
    }

    if errors.is_empty() {
        return Ok(());
    }

    for err in &errors {
        eprintln!("ERROR: {err}");
    }
    anyhow::bail!("{} preflight check(s) failed", errors.len());
}

fn i2c_problem(bus: &Path) -> Option<String> {
    match std::fs::OpenOptions::new().read(true).write(true).open(bus) {
        Ok(_) => None,
        Err(e) => Some(format!(
            "cannot open {}: {e}\n  \
             → enable I2C (dtparam=i2c_arm=on) and add the user to the 'i2c' group",
            bus.display()
        )),
    }
}
