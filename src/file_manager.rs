// src/file_manager.rs

use crate::integrity::file_key;
use crate::models::FileMetadata;
use crate::progress_store::{load_json, ProgressStore};
use crate::writer::MarkedFileWriter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata not found for '{0}'")]
    MetadataNotFound(String),
    #[error("metadata for '{0}' does not tile the file")]
    InvalidMetadata(String),
    #[error("file is in use")]
    InUse,
    #[error("file is not complete")]
    NotComplete,
    #[error("block {0} is already open")]
    BlockAlreadyOpen(usize),
    #[error("block {0} is not writable")]
    BlockNotWritable(usize),
    #[error("block {0} is not open")]
    BlockNotOpen(usize),
    #[error("block index {0} out of range")]
    BlockOutOfRange(usize),
    #[error("all blocks must be closed first")]
    BlocksStillOpen,
    #[error("writer already closed")]
    WriterClosed,
    #[error("block already closed")]
    BlockClosed,
    #[error("only backward seeks are allowed ({from} -> {to})")]
    SeekForward { from: usize, to: usize },
    #[error("write of {len} bytes overflows block {index} ({remain} remaining)")]
    Overflow {
        index: usize,
        len: usize,
        remain: usize,
    },
    #[error("range {offset}+{len} outside block {index}")]
    RangeOutOfBlock { index: usize, offset: u64, len: usize },
    #[error("blocking store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// Owns the data directory and hands out one lock per managed file.
pub struct FileManager {
    base_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl FileManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Opens the metadata of `file_id`. All handles to the same id share a lock.
    pub fn get_file(&self, file_id: &str) -> Result<Arc<MarkedFile>, StoreError> {
        let key = file_key(file_id);
        let meta_path = self.base_dir.join(format!("{key}.meta.json"));
        let metadata: FileMetadata = load_json(&meta_path)?
            .ok_or_else(|| StoreError::MetadataNotFound(file_id.to_string()))?;
        if !metadata.is_tiled() {
            return Err(StoreError::InvalidMetadata(file_id.to_string()));
        }

        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        Ok(Arc::new(MarkedFile {
            id: file_id.to_string(),
            progress: ProgressStore::new(self.base_dir.join(format!("{key}.prog.json"))),
            data_path: self.base_dir.join(format!("{key}.data")),
            base_dir: self.base_dir.clone(),
            key,
            lock,
            metadata,
        }))
    }
}

/// A managed file: its metadata, its data file and its progress record.
#[derive(Debug)]
pub struct MarkedFile {
    id: String,
    key: String,
    metadata: FileMetadata,
    lock: Arc<RwLock<()>>,
    progress: ProgressStore,
    data_path: PathBuf,
    base_dir: PathBuf,
}

impl MarkedFile {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// SHA-256 of the id, the stem of every on-disk artifact.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn companion_path(&self, ext: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{ext}", self.key))
    }

    pub(crate) fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    /// False when the record is missing or a writer currently holds the file.
    pub fn is_complete(&self) -> bool {
        match self.lock.try_read() {
            Ok(_guard) => self.read_complete(),
            Err(_) => false,
        }
    }

    fn read_complete(&self) -> bool {
        matches!(self.progress.load(), Ok(Some(record)) if record.completed)
    }

    /// Waits for the write lock.
    pub async fn open_writer(self: &Arc<Self>) -> Result<MarkedFileWriter, StoreError> {
        let guard = self.lock.clone().write_owned().await;
        MarkedFileWriter::new(self.clone(), guard)
    }

    /// Fails with [`StoreError::InUse`] when a reader or writer holds the file.
    pub fn try_open_writer(self: &Arc<Self>) -> Result<MarkedFileWriter, StoreError> {
        let guard = self
            .lock
            .clone()
            .try_write_owned()
            .map_err(|_| StoreError::InUse)?;
        MarkedFileWriter::new(self.clone(), guard)
    }

    pub fn read_block(&self, index: usize) -> Result<Vec<u8>, StoreError> {
        let size = self
            .metadata
            .blocks
            .get(index)
            .ok_or(StoreError::BlockOutOfRange(index))?
            .size as usize;
        self.read_range(index, 0, size)
    }

    /// Reads `len` bytes at `offset` inside block `index` of a complete file.
    pub fn read_range(&self, index: usize, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let _guard = self.lock.try_read().map_err(|_| StoreError::InUse)?;
        if !self.read_complete() {
            return Err(StoreError::NotComplete);
        }
        let block = self
            .metadata
            .blocks
            .get(index)
            .ok_or(StoreError::BlockOutOfRange(index))?;
        if offset.saturating_add(len as u64) > block.size {
            return Err(StoreError::RangeOutOfBlock { index, offset, len });
        }

        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(self.metadata.block_offset(index) + offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
