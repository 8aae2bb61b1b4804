//! Address database persistence layer
//!
//! The address pool talks to its backing store through [`EndpointStore`]:
//! keyed read/write/erase/exists on the canonical endpoint key, transaction
//! bracketing and a format-version record. [`FileStore`] implements it on top
//! of a JSON file that is rewritten atomically on every commit.

use crate::network::endpoint::{Endpoint, EndpointKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current on-disk format version
pub const STORE_VERSION: u32 = 1;

/// Default address database file name
pub const ADDRESS_FILE: &str = "addr.json";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("No transaction in progress")]
    NoTransaction,
}

/// Backing store contract consumed by the address pool
pub trait EndpointStore: Send {
    fn read(&self, key: &EndpointKey) -> Result<Option<Endpoint>, StorageError>;

    fn write(&mut self, key: &EndpointKey, endpoint: &Endpoint) -> Result<(), StorageError>;

    /// Returns whether the key was present
    fn erase(&mut self, key: &EndpointKey) -> Result<bool, StorageError>;

    fn exists(&self, key: &EndpointKey) -> Result<bool, StorageError>;

    /// Every stored endpoint, in key order
    fn load_all(&self) -> Result<Vec<Endpoint>, StorageError>;

    fn txn_begin(&mut self) -> Result<(), StorageError>;

    fn txn_commit(&mut self) -> Result<(), StorageError>;

    fn txn_abort(&mut self) -> Result<(), StorageError>;

    fn read_version(&self) -> Result<Option<u32>, StorageError>;

    fn write_version(&mut self, version: u32) -> Result<(), StorageError>;

    /// Force everything committed so far to durable storage
    fn flush(&mut self) -> Result<(), StorageError>;
}

/// Serialized file layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct AddressFile {
    version: Option<u32>,
    endpoints: BTreeMap<String, Endpoint>,
}

/// JSON-file backed endpoint store.
///
/// Writes outside a transaction are committed immediately. Inside a
/// transaction they are journaled and applied on commit; nested
/// transactions fold into the outermost one.
pub struct FileStore {
    path: Option<PathBuf>,
    data: AddressFile,
    journal: Vec<BTreeMap<String, Option<Endpoint>>>,
    dirty: bool,
}

impl FileStore {
    /// Open (or create) the address file in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(ADDRESS_FILE);

        let data = if path.exists() {
            let file = fs::File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            AddressFile::default()
        };

        log::debug!(
            "Opened address store {} ({} entries)",
            path.display(),
            data.endpoints.len()
        );

        Ok(Self {
            path: Some(path),
            data,
            journal: Vec::new(),
            dirty: false,
        })
    }

    /// A store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: AddressFile::default(),
            journal: Vec::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn in_transaction(&self) -> bool {
        !self.journal.is_empty()
    }

    fn lookup(&self, key: &str) -> Option<Option<&Endpoint>> {
        self.journal
            .iter()
            .rev()
            .find_map(|txn| txn.get(key).map(|pending| pending.as_ref()))
    }

    fn stage(&mut self, key: String, value: Option<Endpoint>) -> Result<(), StorageError> {
        match self.journal.last_mut() {
            Some(txn) => {
                txn.insert(key, value);
                Ok(())
            }
            None => {
                self.apply(key, value);
                self.save()
            }
        }
    }

    fn apply(&mut self, key: String, value: Option<Endpoint>) {
        match value {
            Some(endpoint) => {
                self.data.endpoints.insert(key, endpoint);
            }
            None => {
                self.data.endpoints.remove(&key);
            }
        }
        self.dirty = true;
    }

    /// Write to a temporary file first, then rename over the original
    fn save(&mut self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.data)?;
        writer.flush()?;
        fs::rename(&temp_path, path)?;

        self.dirty = false;
        Ok(())
    }
}

impl EndpointStore for FileStore {
    fn read(&self, key: &EndpointKey) -> Result<Option<Endpoint>, StorageError> {
        let key = key.to_hex();
        Ok(match self.lookup(&key) {
            Some(pending) => pending.copied(),
            None => self.data.endpoints.get(&key).copied(),
        })
    }

    fn write(&mut self, key: &EndpointKey, endpoint: &Endpoint) -> Result<(), StorageError> {
        self.stage(key.to_hex(), Some(*endpoint))
    }

    fn erase(&mut self, key: &EndpointKey) -> Result<bool, StorageError> {
        let existed = self.exists(key)?;
        self.stage(key.to_hex(), None)?;
        Ok(existed)
    }

    fn exists(&self, key: &EndpointKey) -> Result<bool, StorageError> {
        Ok(self.read(key)?.is_some())
    }

    fn load_all(&self) -> Result<Vec<Endpoint>, StorageError> {
        let mut merged: BTreeMap<&str, Option<&Endpoint>> = self
            .data
            .endpoints
            .iter()
            .map(|(k, v)| (k.as_str(), Some(v)))
            .collect();
        for txn in &self.journal {
            for (k, v) in txn {
                merged.insert(k.as_str(), v.as_ref());
            }
        }

        merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|ep| (key, ep)))
            .map(|(key, endpoint)| {
                if EndpointKey::from_hex(key) == Some(endpoint.key()) {
                    Ok(*endpoint)
                } else {
                    Err(StorageError::InvalidData(format!(
                        "key {} does not match endpoint {}",
                        key, endpoint
                    )))
                }
            })
            .collect()
    }

    fn txn_begin(&mut self) -> Result<(), StorageError> {
        self.journal.push(BTreeMap::new());
        Ok(())
    }

    fn txn_commit(&mut self) -> Result<(), StorageError> {
        let txn = self.journal.pop().ok_or(StorageError::NoTransaction)?;
        match self.journal.last_mut() {
            Some(outer) => outer.extend(txn),
            None => {
                for (key, value) in txn {
                    self.apply(key, value);
                }
                self.save()?;
            }
        }
        Ok(())
    }

    fn txn_abort(&mut self) -> Result<(), StorageError> {
        self.journal.pop().ok_or(StorageError::NoTransaction)?;
        Ok(())
    }

    fn read_version(&self) -> Result<Option<u32>, StorageError> {
        Ok(self.data.version)
    }

    fn write_version(&mut self, version: u32) -> Result<(), StorageError> {
        self.data.version = Some(version);
        self.dirty = true;
        if self.journal.is_empty() {
            self.save()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.save()
    }
}
