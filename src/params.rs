//! Persisted key/value parameter store.
//!
//! The supervised system signals readiness by writing a well-known key, and
//! reads a handful of "enabled" keys at startup. The store is one file per
//! key under a directory.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{CpuwatchError, Result};

pub trait ParamStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Parameter store backed by a directory with one file per key.
#[derive(Debug, Clone)]
pub struct FileParamStore {
    root: PathBuf,
}

impl FileParamStore {
    /// Opens the store at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\', '\0']) {
        return Err(CpuwatchError::Params(format!("invalid key: {:?}", key)));
    }
    Ok(())
}

impl ParamStore for FileParamStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        // Write then rename so readers never observe a partial value.
        let tmp = self.root.join(format!(".{}.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Marks the system as enabled by writing every key in `values`.
///
/// Idempotent: keys that already hold the requested value are left alone.
pub fn arm(store: &dyn ParamStore, values: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in values {
        if store.get(key)?.as_deref() == Some(value.as_bytes()) {
            continue;
        }
        tracing::debug!(key = %key, "writing enablement param");
        store.put(key, value.as_bytes())?;
    }
    Ok(())
}
