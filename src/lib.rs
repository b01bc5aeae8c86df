pub mod backend;
pub mod config;
pub mod crypto;
pub mod ctap2;
pub mod ctaphid;
pub mod diagnostics;
pub mod error;
pub mod hid;
pub mod se;
pub mod store;
pub mod up;

pub use up::UserPresenceProof;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use backend::cipher::AesGcmCipher;
use backend::{BackendState, FallbackManager, HardwareBackend, KeyStorage, SoftwareBackend};
use config::{BackendChoice, Config, PresenceMode};
use se::atecc::Atecc608;
use se::i2c::LinuxI2c;

const RECORD_KEY_FILE: &str = "record.key";

fn data_dir(cfg: &Config) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &cfg.data_dir {
        return Ok(dir.clone());
    }
    Ok(directories::ProjectDirs::from("", "", "pikey")
        .ok_or_else(|| anyhow::anyhow!("cannot determine XDG data dir"))?
        .data_dir()
        .to_path_buf())
}

fn open_hardware(cfg: &Config) -> error::Result<HardwareBackend> {
    let bus = LinuxI2c::open(&cfg.i2c_bus, cfg.se_address)?;
    Ok(HardwareBackend::open(Box::new(Atecc608::new(bus)))?)
}

/// 32 bytes from the chip RNG when there is one, mixed with the OS RNG.
fn fresh_seed(hardware: Option<&HardwareBackend>) -> [u8; 32] {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    if let Some(chip) = hardware.and_then(|hw| hw.get_random(32).ok()) {
        for (s, c) in seed.iter_mut().zip(chip) {
            *s ^= c;
        }
    }
    seed
}

/// Bring up the secure element (if configured) and the software store, and
/// put the fallback manager in front of them.
fn open_backends(cfg: &Config, data_dir: &Path) -> error::Result<FallbackManager> {
    let hardware = match cfg.backend {
        BackendChoice::Software => None,
        BackendChoice::Hardware => Some(open_hardware(cfg)?),
        BackendChoice::Auto => match open_hardware(cfg) {
            Ok(hw) => Some(hw),
            Err(e) => {
                tracing::warn!("Secure element not available ({e}), using software key storage");
                None
            }
        },
    };

    let key_seed = fresh_seed(hardware.as_ref());
    let cipher = AesGcmCipher::load_or_create(&data_dir.join(RECORD_KEY_FILE), &key_seed)?;
    let software = SoftwareBackend::open(
        &data_dir.join("store"),
        Box::new(cipher),
        cfg.max_software_records,
        fresh_seed(hardware.as_ref()),
    )?;

    let manager = FallbackManager::new(hardware, software);
    if cfg.backend == BackendChoice::Hardware && manager.state() != BackendState::HardwareActive {
        return Err(error::Error::Internal("secure element failed its health check".into()));
    }
    Ok(manager)
}

fn open_presence(cfg: &Config) -> anyhow::Result<Box<dyn up::UserPresence>> {
    Ok(match cfg.presence {
        PresenceMode::Button => Box::new(up::GpioButton::open(cfg.button_gpio)?),
        PresenceMode::Pinentry => Box::new(up::PinentryPresence::new(cfg.pinentry.clone())),
        PresenceMode::Auto => {
            tracing::warn!("User presence is auto-confirmed; do not use outside a bench setup");
            Box::new(up::AutoConfirm)
        }
    })
}

pub async fn wipe(cfg: Config) -> anyhow::Result<()> {
    let data_dir = data_dir(&cfg)?;
    std::fs::create_dir_all(&data_dir)?;

    let manager = {
        let cfg = cfg.clone();
        let data_dir = data_dir.clone();
        tokio::task::spawn_blocking(move || open_backends(&cfg, &data_dir)).await??
    };
    let state = manager.state();
    tokio::task::spawn_blocking(move || manager.wipe_all()).await??;
    println!("Wiped key storage ({state:?}) under {}", data_dir.display());

    let key_path = data_dir.join(RECORD_KEY_FILE);
    if key_path.exists() {
        std::fs::remove_file(&key_path)?;
        println!("Deleted {}", key_path.display());
    }
    Ok(())
}

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    let level = match cfg.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting pikey");

    // Preflight checks
    diagnostics::check(&cfg)?;

    let data_dir = data_dir(&cfg)?;
    std::fs::create_dir_all(&data_dir)?;

    // Single-instance lock
    let lock_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.clone());
    let lock_path = lock_dir.join("pikey.lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.try_write()
        .map_err(|_| anyhow::anyhow!("pikey is already running (lock: {})", lock_path.display()))?;

    let certificate = cfg.attestation_cert.as_ref().map(std::fs::read).transpose()?;

    // Key storage and credential store; the chip talks over blocking I2C.
    let (backend, store) = {
        let cfg = cfg.clone();
        let data_dir = data_dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let backend = Arc::new(open_backends(&cfg, &data_dir)?);
            let store = store::CredentialStore::open(backend.clone(), certificate)?;
            Ok((backend, store))
        })
        .await??
    };
    tracing::info!(
        backend = ?backend.state(),
        credentials = store.credential_count(),
        aaguid = %store::identity::uuid_string(&store.identity().aaguid),
        "Credential store loaded"
    );

    let presence = open_presence(&cfg)?;
    let auth = Arc::new(ctap2::Authenticator::new(
        store,
        backend,
        presence,
        cfg.algorithm,
        Duration::from_secs(cfg.presence_timeout_secs),
    )?);

    let transport = hid::start_hid_transport(&cfg.hid_device)?;
    ctaphid::run_ctaphid_loop(transport.incoming_rx, transport.outgoing_tx, auth).await;
    match transport.task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(anyhow::anyhow!("HID transport error: {e}")),
        Err(e) => return Err(anyhow::anyhow!("HID transport panicked: {e}")),
    }
    Ok(())
}
