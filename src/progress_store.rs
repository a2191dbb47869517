// src/progress_store.rs

use crate::file_manager::StoreError;
use crate::models::ProgressRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Persists the progress record of one managed file.
///
/// Every save rewrites the whole file through a temporary sibling and a
/// rename, so a crash leaves either the old or the new record on disk.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record, `None` when the file was never written.
    pub fn load(&self) -> Result<Option<ProgressRecord>, StoreError> {
        load_json(&self.path)
    }

    pub fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        save_json_atomic(&self.path, record)
    }

    /// Loads the record, creating an empty one on disk if absent.
    pub fn load_or_create(&self) -> Result<ProgressRecord, StoreError> {
        match self.load()? {
            Some(record) => Ok(record),
            None => {
                let record = ProgressRecord::default();
                self.save(&record)?;
                Ok(record)
            }
        }
    }
}

pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
