//! Persistent storage for data snapshots
//!
//! Entries are addressed by relative keys of the form
//! `<prefix>/<category>/<uuid>/<type>_<output>`.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::data::DataType;
use crate::output::OutputId;
use provena_core::{StorageConfig, StorageError};

/// Key-addressed byte storage
pub trait TemporalStorage: Send + Sync + fmt::Debug {
    /// Read an entry. Missing entries yield [`StorageError::NotFound`].
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Create or replace an entry
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn exists(&self, key: &str) -> bool;

    /// Remove an entry. Removing a missing entry is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Storage backed by a directory tree
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage rooted at the configured directory, relative to `base`
    pub fn from_config(config: &StorageConfig, base: &Path) -> Self {
        Self::new(base.join(&config.root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key '{}'", key),
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Number of stored entries and their total size
    pub fn status(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();

        if !self.root.exists() {
            return Ok(stats);
        }

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            stats.entries += 1;
            if let Ok(meta) = entry.metadata() {
                stats.total_size += meta.len();
            }
        }

        Ok(stats)
    }

    /// Remove every entry, returning what was removed
    pub fn clear(&self) -> Result<StorageStats, StorageError> {
        let stats = self.status()?;
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        info!(
            entries = stats.entries,
            size = %stats.formatted_size(),
            "cleared storage at {}",
            self.root.display()
        );
        Ok(stats)
    }
}

impl TemporalStorage for DirStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        debug!(key, bytes = bytes.len(), "stored entry");
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.resolve(key).map(|path| path.is_file()).unwrap_or(false)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Storage statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of stored entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl StorageStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// A storage handle plus the key prefix a filter stores under
#[derive(Debug, Clone)]
pub struct StorageContext {
    storage: Arc<dyn TemporalStorage>,
    prefix: String,
    verify_checksums: bool,
}

impl StorageContext {
    pub fn new(storage: Arc<dyn TemporalStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            verify_checksums: true,
        }
    }

    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn storage(&self) -> &Arc<dyn TemporalStorage> {
        &self.storage
    }

    pub fn verifies_checksums(&self) -> bool {
        self.verify_checksums
    }

    /// Base key of a filter's entries: `<prefix>/<category>/<uuid>`
    pub fn filter_key(&self, category: &str, uuid: &Uuid) -> String {
        let filter = format!("{}/{}", category, uuid);
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            filter
        } else {
            format!("{}/{}", prefix, filter)
        }
    }
}

/// Key of one data entry under a filter's base key
pub fn data_key(base: &str, data_type: &DataType, output: OutputId) -> String {
    format!("{}/{}_{}", base, data_type, output)
}

/// Hex-encoded SHA-256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Where a data object can fetch its stored content from
#[derive(Debug, Clone)]
pub struct FetchContext {
    storage: Arc<dyn TemporalStorage>,
    key: String,
    checksum: Option<String>,
}

impl FetchContext {
    pub fn new(storage: Arc<dyn TemporalStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            checksum: None,
        }
    }

    /// Reject stored content that does not hash to `checksum`
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage(&self) -> &Arc<dyn TemporalStorage> {
        &self.storage
    }

    pub fn exists(&self) -> bool {
        self.storage.exists(&self.key)
    }

    /// Read the stored content, verifying its checksum when one is known
    pub fn read(&self) -> Result<Vec<u8>, StorageError> {
        let bytes = self.storage.read(&self.key)?;
        if let Some(expected) = &self.checksum {
            if checksum(&bytes) != *expected {
                return Err(StorageError::ChecksumMismatch(self.key.clone()));
            }
        }
        Ok(bytes)
    }
}
