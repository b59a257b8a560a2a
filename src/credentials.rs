use std::path::PathBuf;

use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

const SERVICE: &str = "draftmerge";
const API_KEY_ACCOUNT: &str = "text-generation-api-key";

/// API key storage in the system keyring
#[derive(Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, API_KEY_ACCOUNT).context("Failed to create keyring entry")
    }

    pub fn store_api_key(&self, api_key: &str) -> Result<()> {
        self.entry()?
            .set_password(api_key)
            .context("Failed to store API key in keyring")?;
        log::debug!("API key stored in keyring");
        Ok(())
    }

    pub fn get_api_key(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(key) => Ok(Some(key)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve API key: {}", e)),
        }
    }

    pub fn delete_api_key(&self) -> Result<()> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete API key: {}", e)),
        }
    }

    /// Check if the system keyring is usable on this machine
    pub fn is_available() -> bool {
        if let Ok(entry) = Entry::new("draftmerge-probe", "probe") {
            if entry.set_password("probe").is_ok() {
                let _ = entry.delete_password();
                return true;
            }
        }
        false
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-only file under the config directory, for systems without a keyring
#[derive(Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("draftmerge");
        Ok(Self::at(dir.join("api_key")))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn store_api_key(&self, api_key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create credentials directory")?;
        }
        std::fs::write(&self.path, api_key).context("Failed to write API key file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict API key file permissions")?;
        }

        log::warn!("API key stored in {:?}; install a system keyring for better security", self.path);
        Ok(())
    }

    pub fn get_api_key(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let key = std::fs::read_to_string(&self.path).context("Failed to read API key file")?;
        let key = key.trim().to_string();
        Ok(if key.is_empty() { None } else { Some(key) })
    }

    pub fn delete_api_key(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to delete API key file")?;
        }
        Ok(())
    }
}

/// Keyring when available, otherwise the file fallback
#[derive(Clone)]
pub enum ApiKeyStore {
    SystemKeyring(KeyringStore),
    File(FileKeyStore),
}

impl ApiKeyStore {
    pub fn new() -> Result<Self> {
        if KeyringStore::is_available() {
            Ok(Self::SystemKeyring(KeyringStore::new()))
        } else {
            Ok(Self::File(FileKeyStore::new()?))
        }
    }

    pub fn store_api_key(&self, api_key: &str) -> Result<()> {
        match self {
            Self::SystemKeyring(store) => store.store_api_key(api_key),
            Self::File(store) => store.store_api_key(api_key),
        }
    }

    pub fn get_api_key(&self) -> Result<Option<String>> {
        match self {
            Self::SystemKeyring(store) => store.get_api_key(),
            Self::File(store) => store.get_api_key(),
        }
    }

    pub fn delete_api_key(&self) -> Result<()> {
        match self {
            Self::SystemKeyring(store) => store.delete_api_key(),
            Self::File(store) => store.delete_api_key(),
        }
    }

    /// Stored key, or the `DRAFTMERGE_API_KEY` environment variable.
    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(key) = self.get_api_key()? {
            return Ok(Some(key));
        }
        Ok(std::env::var("DRAFTMERGE_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty()))
    }
}
