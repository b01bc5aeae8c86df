use std::path::PathBuf;

use crate::crypto::Algorithm;

/// AAGUID reported when no secure element serial is available at first init.
pub const DEFAULT_AAGUID: [u8; 16] = [
    0x70, 0x69, 0x6b, 0x65, 0x79, 0x2d, 0x4f, 0x80, 0x9a, 0x51, 0x2e, 0x6f, 0x00, 0x00, 0x00, 0x01,
];
pub const MAX_CHANNELS: usize = 8;
pub const CHANNEL_TIMEOUT_SECS: u64 = 30;
/// CTAPHID transaction timeout between frames of one message.
pub const MESSAGE_TIMEOUT_MS: u64 = 3000;
pub const KEEPALIVE_INTERVAL_MS: u64 = 100;
pub const NEXT_ASSERTION_WINDOW_SECS: u64 = 30;
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;
pub const PIN_RETRIES: u8 = 8;
/// Mismatches in a row before PIN entry needs a power cycle.
pub const PIN_MAX_CONSECUTIVE_FAILURES: u8 = 3;
pub const DEFAULT_MAX_SOFTWARE_RECORDS: usize = 128;
pub const MAX_MSG_SIZE: usize = 1200;
pub const MAX_CREDENTIAL_COUNT_IN_LIST: usize = 8;
pub const MAX_CREDENTIAL_ID_LENGTH: usize = 128;

/// Which signature algorithms are advertised and accepted.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlgorithmMode {
    #[default]
    Classical,
    Pqc,
    Hybrid,
}

impl AlgorithmMode {
    /// Supported algorithms in order of preference for GetInfo.
    pub fn supported(self) -> &'static [Algorithm] {
        match self {
            Self::Classical => &[Algorithm::Es256],
            Self::Pqc => &[Algorithm::MlDsa44, Algorithm::MlDsa65, Algorithm::Es256],
            Self::Hybrid => &[
                Algorithm::HybridEs256MlDsa44,
                Algorithm::MlDsa44,
                Algorithm::MlDsa65,
                Algorithm::Es256,
            ],
        }
    }

    pub fn accepts(self, algorithm: Algorithm) -> bool {
        self.supported().contains(&algorithm)
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    Hardware,
    Software,
    /// Secure element when it answers, software otherwise.
    #[default]
    Auto,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceMode {
    #[default]
    Button,
    Pinentry,
    /// Confirms every request. Bench use only.
    Auto,
}

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "pikey", about = "FIDO2 security key on a USB gadget")]
pub struct Config {
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[arg(long, default_value = "/dev/hidg0")]
    pub hid_device: PathBuf,
    #[arg(long, default_value = "/dev/i2c-1")]
    pub i2c_bus: PathBuf,
    #[arg(long, default_value = "0x60", value_parser = parse_address)]
    pub se_address: u16,
    #[arg(long, value_enum, default_value_t = BackendChoice::Auto)]
    pub backend: BackendChoice,
    #[arg(long, value_enum, default_value_t = AlgorithmMode::Classical)]
    pub algorithm: AlgorithmMode,
    #[arg(long, value_enum, default_value_t = PresenceMode::Button)]
    pub presence: PresenceMode,
    /// BCM GPIO number of the active-low presence button.
    #[arg(long, default_value_t = 26)]
    pub button_gpio: u32,
    #[arg(long, default_value = "pinentry")]
    pub pinentry: String,
    #[arg(long, default_value_t = 30)]
    pub presence_timeout_secs: u64,
    /// DER certificate for the attestation key; enables basic attestation.
    #[arg(long)]
    pub attestation_cert: Option<PathBuf>,
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MAX_SOFTWARE_RECORDS)]
    pub max_software_records: usize,
    /// Delete all credentials, PIN state and device identity, then exit.
    #[arg(long)]
    pub wipe: bool,
}

fn parse_address(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7F => Ok(addr),
        Ok(addr) => Err(format!("{addr:#x} is not a 7-bit I2C address")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let cfg = Config::parse_from(["pikey"]);
        assert_eq!(cfg.se_address, 0x60);
        assert_eq!(cfg.backend, BackendChoice::Auto);
        assert_eq!(cfg.algorithm, AlgorithmMode::Classical);
        assert_eq!(cfg.presence_timeout_secs, 30);
        assert!(!cfg.wipe);
    }

    #[test]
    fn test_flags() {
        let cfg = Config::parse_from([
            "pikey",
            "-vv",
            "--algorithm",
            "hybrid",
            "--backend",
            "software",
            "--presence",
            "auto",
            "--se-address",
            "96",
        ]);
        assert_eq!(cfg.verbose, 2);
        assert_eq!(cfg.algorithm, AlgorithmMode::Hybrid);
        assert_eq!(cfg.backend, BackendChoice::Software);
        assert_eq!(cfg.presence, PresenceMode::Auto);
        assert_eq!(cfg.se_address, 0x60);
        assert!(Config::try_parse_from(["pikey", "--se-address", "0x80"]).is_err());
    }

    #[test]
    fn test_mode_algorithms() {
        assert_eq!(AlgorithmMode::Classical.supported(), &[Algorithm::Es256]);
        assert!(AlgorithmMode::Pqc.accepts(Algorithm::MlDsa65));
        assert!(!AlgorithmMode::Pqc.accepts(Algorithm::HybridEs256MlDsa44));
        assert_eq!(AlgorithmMode::Hybrid.supported()[0], Algorithm::HybridEs256MlDsa44);
    }
}
