//! # Identity Persistence
//!
//! Durable storage for the device ID and the TLS client credential.
//!
//! The file-backed implementation keeps two files in one directory:
//!
//! - a device-ID file holding the UUID as text
//! - a JSON keystore mapping alias to certificate, private key and ARN
//!
//! Every write goes to a temporary file in the same directory which is then
//! renamed over the target, so a reader sees either the old content or the
//! new content and never a partial entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::IdentityConfig;
use crate::error::{Result, TelemetryError};

/// Certificate and private key issued for this device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub certificate_pem: String,
    pub private_key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_arn: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("certificate_arn", &self.certificate_arn)
            .field("private_key_pem", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Primitives the identity store needs from durable storage.
pub trait IdentityPersistence: Send + Sync {
    fn read_device_id(&self) -> Result<Option<String>>;

    fn write_device_id(&self, device_id: &str) -> Result<()>;

    fn credential_exists(&self, alias: &str) -> Result<bool> {
        Ok(self.read_credential(alias)?.is_some())
    }

    fn read_credential(&self, alias: &str) -> Result<Option<Credential>>;

    fn write_credential(&self, alias: &str, credential: &Credential) -> Result<()>;
}

type Keystore = BTreeMap<String, Credential>;

/// Identity files under one directory.
#[derive(Debug, Clone)]
pub struct FileIdentityPersistence {
    dir: PathBuf,
    device_id_file: String,
    keystore_name: String,
}

impl FileIdentityPersistence {
    pub fn new(
        dir: impl Into<PathBuf>,
        device_id_file: impl Into<String>,
        keystore_name: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            device_id_file: device_id_file.into(),
            keystore_name: keystore_name.into(),
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self::new(
            &config.storage_dir,
            &config.device_id_file,
            &config.keystore_name,
        )
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.dir.join(&self.keystore_name)
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.dir.join(&self.device_id_file)
    }

    fn read_keystore(&self) -> Result<Keystore> {
        match read_optional(&self.keystore_path())? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                TelemetryError::Keystore(format!(
                    "Keystore {} is unreadable: {}",
                    self.keystore_path().display(),
                    e
                ))
            }),
            None => Ok(Keystore::new()),
        }
    }

    fn write_atomic(&self, target: &Path, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| TelemetryError::Io(e.error))?;

        debug!("Wrote {}", target.display());
        Ok(())
    }
}

impl IdentityPersistence for FileIdentityPersistence {
    fn read_device_id(&self) -> Result<Option<String>> {
        let Some(bytes) = read_optional(&self.device_id_path())? else {
            return Ok(None);
        };

        let text = String::from_utf8(bytes).map_err(|_| {
            TelemetryError::Identity(format!(
                "Device ID file {} is not valid UTF-8",
                self.device_id_path().display()
            ))
        })?;

        let id = text.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    fn write_device_id(&self, device_id: &str) -> Result<()> {
        self.write_atomic(&self.device_id_path(), device_id.as_bytes())
    }

    fn read_credential(&self, alias: &str) -> Result<Option<Credential>> {
        Ok(self.read_keystore()?.remove(alias))
    }

    fn write_credential(&self, alias: &str, credential: &Credential) -> Result<()> {
        let mut keystore = self.read_keystore()?;
        keystore.insert(alias.to_string(), credential.clone());
        let contents = serde_json::to_vec_pretty(&keystore)?;
        self.write_atomic(&self.keystore_path(), &contents)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
