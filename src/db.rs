// src/db.rs
use crate::error::StoreError;
use crate::models::{Holdings, PortfolioRecord};
use chrono::Local;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const CREDENTIALS_STEM: &str = "users";
const MAX_USERNAME_LEN: usize = 64;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Usernames become file names, so only a conservative character set is allowed.
pub fn validate_username(username: &str) -> Result<(), StoreError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && !username.starts_with('.')
        && username != CREDENTIALS_STEM
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidUsername(username.to_string()))
    }
}

pub async fn init(data_dir: &Path) -> Result<(CredentialStore, PortfolioStore), StoreError> {
    fs::create_dir_all(data_dir)
        .await
        .map_err(|source| StoreError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
    info!("Using data directory {}", data_dir.display());
    Ok((
        CredentialStore::new(data_dir),
        PortfolioStore::new(data_dir),
    ))
}

/// Reads a JSON record; `None` when the file does not exist.
async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes to a sibling temp file and renames it over `path`.
async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(record)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, rand::random::<u64>()));

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, &bytes).await.map_err(io_err)?;
    if let Err(source) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_err(source));
    }
    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Shared username -> password digest record (`users.json`).
pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(format!("{}.json", CREDENTIALS_STEM)),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(read_record(&self.path).await?.unwrap_or_default())
    }

    /// Inserts or overwrites the digest for `username`.
    pub async fn save(&self, username: &str, digest: &str) -> Result<(), StoreError> {
        validate_username(username)?;
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        users.insert(username.to_string(), digest.to_string());
        write_record(&self.path, &users).await
    }

    /// Inserts only if `username` has no entry yet. Returns false if it did.
    pub async fn insert_new(&self, username: &str, digest: &str) -> Result<bool, StoreError> {
        validate_username(username)?;
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), digest.to_string());
        write_record(&self.path, &users).await?;
        Ok(true)
    }

    /// Digest verification runs on the blocking pool.
    pub async fn check(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        let users = self.read_all().await?;
        match users.get(username) {
            Some(stored) => Ok(crate::auth::verify_blocking(password, stored).await?),
            None => Ok(false),
        }
    }

    /// Returns false if there was no entry to remove.
    pub async fn remove(&self, username: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut users = self.read_all().await?;
        if users.remove(username).is_none() {
            return Ok(false);
        }
        write_record(&self.path, &users).await?;
        Ok(true)
    }

    pub async fn exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.read_all().await?.contains_key(username))
    }
}

/// One `<username>.json` record per user.
pub struct PortfolioStore {
    data_dir: PathBuf,
}

impl PortfolioStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn record_path(&self, username: &str) -> Result<PathBuf, StoreError> {
        validate_username(username)?;
        Ok(self.data_dir.join(format!("{}.json", username)))
    }

    pub async fn exists(&self, username: &str) -> Result<bool, StoreError> {
        let path = self.record_path(username)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// A missing record loads as an empty portfolio with no timestamp.
    pub async fn load(&self, username: &str) -> Result<PortfolioRecord, StoreError> {
        let path = self.record_path(username)?;
        Ok(read_record(&path).await?.unwrap_or_default())
    }

    /// Replaces the record with `holdings` as given and returns the new timestamp.
    pub async fn save(&self, username: &str, holdings: &Holdings) -> Result<String, StoreError> {
        let path = self.record_path(username)?;
        let record = PortfolioRecord {
            holdings: holdings.clone(),
            last_updated: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        write_record(&path, &record).await?;
        info!(
            "Saved portfolio for {} ({} coins)",
            username,
            record.holdings.len()
        );
        Ok(record.last_updated)
    }
}
