//! Key Store
//!
//! Persistence capability for the agent keypair. The file-backed store is
//! used in production; the in-memory store keeps tests off the file system.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CryptoError;

const PRIVATE_KEY_FILE: &str = "private_key.pem";
const PUBLIC_KEY_FILE: &str = "public_key.pem";

/// PEM encoded key material as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKeypair {
    pub private_pem: String,
    /// Public half, when it was stored alongside the private key
    pub public_pem: Option<String>,
}

/// Load/save capability for the agent keypair
pub trait KeyStore: Send + Sync {
    /// Returns `None` when no key has been persisted yet
    fn load(&self) -> Result<Option<StoredKeypair>, CryptoError>;

    fn save(&self, keys: &StoredKeypair) -> Result<(), CryptoError>;
}

/// Platform default directory for the agent keys
pub fn default_key_dir() -> PathBuf {
    if cfg!(windows) {
        let base = std::env::var_os("APPDATA").map(PathBuf::from).unwrap_or_default();
        base.join("Echoes").join("agent")
    } else {
        PathBuf::from("/etc/echoes/agent")
    }
}

/// Keys stored as PEM files in a directory
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_private(&self, path: &Path, pem: &str) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(pem.as_bytes())
        }

        #[cfg(not(unix))]
        {
            fs::write(path, pem)
        }
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<StoredKeypair>, CryptoError> {
        let private_path = self.dir.join(PRIVATE_KEY_FILE);
        if !private_path.exists() {
            return Ok(None);
        }

        let private_pem = fs::read_to_string(&private_path)?;
        let public_path = self.dir.join(PUBLIC_KEY_FILE);
        let public_pem = if public_path.exists() {
            Some(fs::read_to_string(&public_path)?)
        } else {
            None
        };

        Ok(Some(StoredKeypair {
            private_pem,
            public_pem,
        }))
    }

    fn save(&self, keys: &StoredKeypair) -> Result<(), CryptoError> {
        fs::create_dir_all(&self.dir)?;
        self.write_private(&self.dir.join(PRIVATE_KEY_FILE), &keys.private_pem)?;
        if let Some(public_pem) = &keys.public_pem {
            fs::write(self.dir.join(PUBLIC_KEY_FILE), public_pem)?;
        }
        Ok(())
    }
}

/// Keys held in memory only
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Option<StoredKeypair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: StoredKeypair) -> Self {
        Self {
            keys: Mutex::new(Some(keys)),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<StoredKeypair>, CryptoError> {
        Ok(self.keys.lock().clone())
    }

    fn save(&self, keys: &StoredKeypair) -> Result<(), CryptoError> {
        *self.keys.lock() = Some(keys.clone());
        Ok(())
    }
}
