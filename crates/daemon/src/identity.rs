//! Local device identity.
//!
//! The daemon keeps two small files in its data directory:
//!
//! - `installation_id`: a UUID generated on first start
//! - `fingerprint.salt`: 32 random bytes, hex encoded
//!
//! Together with the platform name and the machine id they determine the
//! device fingerprint shown to peers. Losing the salt changes the fingerprint.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tether_protocol::{DeviceFingerprint, DeviceId, FingerprintSalt};
use tracing::info;

const INSTALLATION_ID_FILE: &str = "installation_id";
const SALT_FILE: &str = "fingerprint.salt";

/// Files consulted for a stable machine id, in order.
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// The identity this daemon presents to peers.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Device id announced on the signaling channel.
    pub device_id: DeviceId,
    /// Per-installation UUID.
    pub installation_id: String,
    /// Fingerprint for out-of-band comparison.
    pub fingerprint: DeviceFingerprint,
}

impl LocalIdentity {
    /// Loads the identity from `data_dir`, creating missing files.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self> {
        Self::load_or_generate_with(data_dir, std::env::consts::OS, &machine_id())
    }

    /// Same as [`LocalIdentity::load_or_generate`] with explicit platform
    /// inputs.
    pub fn load_or_generate_with(data_dir: &Path, platform: &str, machine_id: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create directory: {}", data_dir.display()))?;

        let installation_id = load_or_generate_installation_id(&data_dir.join(INSTALLATION_ID_FILE))?;
        let salt_path = data_dir.join(SALT_FILE);
        let salt = load_salt(&salt_path)?;
        let had_salt = salt.is_some();

        let (fingerprint, salt) =
            DeviceFingerprint::generate(platform, machine_id, &installation_id, salt)
                .context("Failed to compute device fingerprint")?;

        if !had_salt {
            write_private(&salt_path, salt.to_hex().as_bytes())?;
            info!(path = %salt_path.display(), "Generated new fingerprint salt");
        }

        let device_id = DeviceId::new(format!("{}-{}", platform, &installation_id[..8]))
            .context("Failed to build device id")?;

        Ok(Self {
            device_id,
            installation_id,
            fingerprint,
        })
    }
}

fn load_or_generate_installation_id(path: &Path) -> Result<String> {
    if path.exists() {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read installation id: {}", path.display()))?;
        let id = contents.trim();
        uuid::Uuid::parse_str(id)
            .with_context(|| format!("Invalid installation id in {}", path.display()))?;
        return Ok(id.to_string());
    }

    let id = uuid::Uuid::new_v4().to_string();
    write_private(path, id.as_bytes())?;
    info!(installation_id = %id, "Generated new installation id");
    Ok(id)
}

fn load_salt(path: &Path) -> Result<Option<FingerprintSalt>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read fingerprint salt: {}", path.display()))?;
    let salt = FingerprintSalt::from_hex(&contents)
        .with_context(|| format!("Invalid fingerprint salt in {}", path.display()))?;
    Ok(Some(salt))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Best-effort stable machine id: the systemd/dbus id, else the hostname.
fn machine_id() -> String {
    MACHINE_ID_PATHS
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "unknown-machine".to_string())
}
