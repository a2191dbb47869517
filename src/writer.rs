// src/writer.rs

use crate::file_manager::{MarkedFile, StoreError};
use crate::integrity::sha256_hex;
use crate::models::{BlockMeta, BlockProgress, FileMetadata, ProgressRecord, ProgressStatus};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;

/// Exclusive write handle on a [`MarkedFile`].
///
/// Holds the file's write lock until [`MarkedFileWriter::close`] is called or
/// the last handle is dropped. Shared between the engine and its sources.
pub struct MarkedFileWriter {
    file: Arc<MarkedFile>,
    state: Mutex<WriterState>,
}

struct WriterState {
    status: ProgressRecord,
    opened: BTreeSet<usize>,
    guard: Option<OwnedRwLockWriteGuard<()>>,
}

impl WriterState {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.guard.is_none() {
            return Err(StoreError::WriterClosed);
        }
        Ok(())
    }
}

impl MarkedFileWriter {
    pub(crate) fn new(
        file: Arc<MarkedFile>,
        guard: OwnedRwLockWriteGuard<()>,
    ) -> Result<Self, StoreError> {
        let status = file.progress_store().load_or_create()?;
        Ok(Self {
            file,
            state: Mutex::new(WriterState {
                status,
                opened: BTreeSet::new(),
                guard: Some(guard),
            }),
        })
    }

    pub fn file(&self) -> &Arc<MarkedFile> {
        &self.file
    }

    pub fn metadata(&self) -> &FileMetadata {
        self.file.metadata()
    }

    pub fn block_count(&self) -> usize {
        self.metadata().block_count()
    }

    pub fn status(&self) -> ProgressRecord {
        self.state.lock().status.clone()
    }

    /// All indices not yet verified.
    pub fn writable_blocks(&self) -> BTreeSet<usize> {
        let state = self.state.lock();
        self.writable_from(&state.status)
    }

    /// Writable indices not currently open.
    pub fn openable_blocks(&self) -> BTreeSet<usize> {
        let state = self.state.lock();
        let mut blocks = self.writable_from(&state.status);
        blocks.retain(|i| !state.opened.contains(i));
        blocks
    }

    pub fn is_block_open(&self, index: usize) -> bool {
        self.state.lock().opened.contains(&index)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().guard.is_none()
    }

    fn writable_from(&self, status: &ProgressRecord) -> BTreeSet<usize> {
        (0..self.block_count())
            .filter(|i| !status.completed_blocks.contains(i))
            .collect()
    }

    /// Maps block `index` for writing, resuming from its recorded cursor.
    ///
    /// A block whose last flush failed verification restarts from offset 0.
    pub fn open_block(self: &Arc<Self>, index: usize) -> Result<Block, StoreError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let meta = self.file.metadata();
        let block_meta = meta
            .blocks
            .get(index)
            .cloned()
            .ok_or(StoreError::BlockOutOfRange(index))?;
        if state.opened.contains(&index) {
            return Err(StoreError::BlockAlreadyOpen(index));
        }
        if state.status.completed_blocks.contains(&index) {
            return Err(StoreError::BlockNotWritable(index));
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.file.data_path())?;
        if data.metadata()?.len() < meta.size {
            data.set_len(meta.size)?;
        }
        // SAFETY: the data file is only mapped while this writer holds the
        // file's write lock, and each block window is mapped at most once.
        let map = unsafe {
            MmapOptions::new()
                .offset(meta.block_offset(index))
                .len(block_meta.size as usize)
                .map_mut(&data)?
        };

        let recorded = state.status.progress_of(index);
        let cursor = recorded
            .map(|p| p.progress.min(block_meta.size) as usize)
            .unwrap_or(0);
        state.opened.insert(index);
        drop(state);

        let mut block = Block {
            writer: self.clone(),
            index,
            meta: block_meta,
            map,
            cursor,
            closed: false,
        };
        if matches!(recorded, Some(p) if p.status == ProgressStatus::HashMismatch) {
            tracing::debug!(file = %self.file.id(), block = index, "restarting block after hash mismatch");
            block.seek_back(0)?;
        }
        Ok(block)
    }

    /// Resets progress and deletes the data file. No block may be open.
    pub fn clear_file(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.opened.is_empty() {
            return Err(StoreError::BlocksStillOpen);
        }

        let status = ProgressRecord::default();
        self.file.progress_store().save(&status)?;
        state.status = status;
        match std::fs::remove_file(self.file.data_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(file = %self.file.id(), "file cleared");
        Ok(())
    }

    /// Releases the write lock. Every block must be closed first.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.guard.is_none() {
            return Ok(());
        }
        if !state.opened.is_empty() {
            return Err(StoreError::BlocksStillOpen);
        }
        state.guard = None;
        Ok(())
    }

    fn flush_block(&self, block: &Block) -> Result<ProgressStatus, StoreError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.opened.contains(&block.index) {
            return Err(StoreError::BlockNotOpen(block.index));
        }
        self.record_block(&mut state, block)
    }

    fn close_block(&self, block: &Block) -> Result<ProgressStatus, StoreError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.opened.remove(&block.index) {
            return Err(StoreError::BlockNotOpen(block.index));
        }
        self.record_block(&mut state, block)
    }

    fn record_block(&self, state: &mut WriterState, block: &Block) -> Result<ProgressStatus, StoreError> {
        let progress = block.cursor as u64;
        let (next, result) = if progress == block.meta.size {
            if sha256_hex(&block.map[..]) == block.meta.hash {
                let mut next = state.status.clone().with_block_complete(block.index);
                if self.writable_from(&next).is_empty() {
                    next = next.with_all_complete();
                }
                (next, ProgressStatus::Completed)
            } else {
                tracing::warn!(file = %self.file.id(), block = block.index, "block hash mismatch");
                let next = state.status.clone().with_status(
                    block.index,
                    BlockProgress {
                        progress,
                        status: ProgressStatus::HashMismatch,
                    },
                );
                (next, ProgressStatus::HashMismatch)
            }
        } else {
            let next = state.status.clone().with_status(
                block.index,
                BlockProgress {
                    progress,
                    status: ProgressStatus::Downloading,
                },
            );
            (next, ProgressStatus::Downloading)
        };

        self.file.progress_store().save(&next)?;
        state.status = next;
        Ok(result)
    }
}

/// A mapped window over one block with a forward-only write cursor.
pub struct Block {
    writer: Arc<MarkedFileWriter>,
    index: usize,
    meta: BlockMeta,
    map: MmapMut,
    cursor: usize,
    closed: bool,
}

impl Block {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remain(&self) -> usize {
        self.size() - self.cursor
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::BlockClosed);
        }
        if data.len() > self.remain() {
            return Err(StoreError::Overflow {
                index: self.index,
                len: data.len(),
                remain: self.remain(),
            });
        }
        let end = self.cursor + data.len();
        self.map[self.cursor..end].copy_from_slice(data);
        self.cursor = end;
        Ok(())
    }

    pub fn seek_back(&mut self, to: usize) -> Result<(), StoreError> {
        if to > self.cursor {
            return Err(StoreError::SeekForward {
                from: self.cursor,
                to,
            });
        }
        self.cursor = to;
        Ok(())
    }

    /// Forces the window to disk and records progress; verifies a full block.
    pub fn flush(&mut self) -> Result<ProgressStatus, StoreError> {
        if self.closed {
            return Err(StoreError::BlockClosed);
        }
        self.map.flush()?;
        self.writer.flush_block(self)
    }

    /// Flushes, then frees the block's slot in the writer.
    pub fn close(mut self) -> Result<ProgressStatus, StoreError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<ProgressStatus, StoreError> {
        if self.closed {
            return Err(StoreError::BlockClosed);
        }
        self.closed = true;
        let flushed = self.map.flush();
        let status = self.writer.close_block(self)?;
        flushed?;
        Ok(status)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                tracing::warn!(block = self.index, error = %e, "failed to close block on drop");
            }
        }
    }
}
