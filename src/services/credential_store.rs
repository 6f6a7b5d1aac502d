//! Credential persistence
//!
//! Keeps the device identity and the saved network credential as two
//! independent JSON records below the configuration directory.

use anyhow::{Context, Result};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fmt,
    fs::{self, File},
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use uuid::Uuid;

const IDENTITY_FILE: &str = "device.json";
const NETWORK_CREDENTIAL_FILE: &str = "wifi.json";
const DEVICE_CODE_LEN: usize = 8;

/// Identity presented to the cloud service on every connect
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceIdentity {
    #[serde(rename = "device_code")]
    pub code: String,
    #[serde(rename = "device_secret")]
    pub secret: String,
}

impl DeviceIdentity {
    /// Generate a fresh identity
    ///
    /// The code is short and upper case so it can be typed in from a printout.
    pub fn generate() -> Self {
        let code = Uuid::new_v4().simple().to_string()[..DEVICE_CODE_LEN].to_uppercase();
        let secret = Uuid::new_v4().to_string();

        Self { code, secret }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("code", &self.code)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// WiFi network the device should join
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkCredential {
    pub ssid: String,
    #[serde(rename = "password")]
    pub passphrase: String,
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Narrow persistence contract used by the state machine and the portal
///
/// The portal is the only writer of the network credential, the state
/// machine only reads it.
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait CredentialStore {
    /// Load the device identity, creating and persisting one on first boot
    fn load_identity(&self) -> Result<DeviceIdentity>;
    fn has_network_credential(&self) -> Result<bool>;
    fn load_network_credential(&self) -> Result<Option<NetworkCredential>>;
    fn save_network_credential(&self, credential: &NetworkCredential) -> Result<()>;
    /// Forget the saved network; the next boot starts in provisioning
    fn clear_network_credential(&self) -> Result<()>;
}

/// Credential store backed by JSON files
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    config_dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn identity_path(&self) -> PathBuf {
        self.config_dir.join(IDENTITY_FILE)
    }

    fn network_credential_path(&self) -> PathBuf {
        self.config_dir.join(NETWORK_CREDENTIAL_FILE)
    }

    /// Read a JSON record
    ///
    /// # Returns
    /// `None` if the file does not exist, an error if it cannot be read or parsed
    fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(format!("failed to read {}", path.display()));
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .context(format!("failed to parse {}", path.display()))
    }

    /// Write a JSON record atomically, optionally restricting its permissions
    ///
    /// # Arguments
    /// * `path` - Target file
    /// * `record` - Value to serialize
    /// * `mode` - Unix permission bits applied before the record becomes visible
    fn write_record<T: Serialize>(path: &Path, record: &T, mode: Option<u32>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("failed to create {}", parent.display()))?;
        }

        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(record).context("failed to serialize record")?;

        let mut file = File::create(&temp_path)
            .context(format!("failed to create {}", temp_path.display()))?;

        if let Some(mode) = mode {
            let mut perm = file
                .metadata()
                .context("failed to read temp file metadata")?
                .permissions();
            perm.set_mode(mode);
            file.set_permissions(perm)
                .context("failed to set record permissions")?;
        }

        file.write_all(&content)
            .context(format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .context(format!("failed to sync {}", temp_path.display()))?;

        fs::rename(&temp_path, path).context(format!("failed to replace {}", path.display()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_identity(&self) -> Result<DeviceIdentity> {
        let path = self.identity_path();

        match Self::read_record::<DeviceIdentity>(&path) {
            Ok(Some(identity)) if !identity.code.is_empty() && !identity.secret.is_empty() => {
                debug!("loaded device identity {}", identity.code);
                return Ok(identity);
            }
            Ok(Some(_)) => warn!("device identity is incomplete, generating a new one"),
            Ok(None) => info!("no device identity found, generating one"),
            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                warn!("device identity is unreadable, generating a new one: {e:#}")
            }
            Err(e) => return Err(e),
        }

        let identity = DeviceIdentity::generate();
        Self::write_record(&path, &identity, Some(0o600)).context("failed to store device identity")?;
        info!("generated device code {}", identity.code);

        Ok(identity)
    }

    fn has_network_credential(&self) -> Result<bool> {
        Ok(self.load_network_credential()?.is_some())
    }

    fn load_network_credential(&self) -> Result<Option<NetworkCredential>> {
        let credential = Self::read_record::<NetworkCredential>(&self.network_credential_path())
            .context("failed to load network credential")?;

        Ok(credential.filter(|c| !c.ssid.is_empty()))
    }

    fn save_network_credential(&self, credential: &NetworkCredential) -> Result<()> {
        debug!("save_network_credential() called for ssid {}", credential.ssid);

        Self::write_record(&self.network_credential_path(), credential, Some(0o600))
            .context("failed to save network credential")
    }

    fn clear_network_credential(&self) -> Result<()> {
        match fs::remove_file(self.network_credential_path()) {
            Ok(()) => {
                info!("network credential cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to clear network credential"),
        }
    }
}
