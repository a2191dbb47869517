use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use sha2::{Sha256, Digest};
use thiserror::Error;

use crate::file_manager::MarkedFile;
use crate::models::{BlockMeta, FileMetadata};

pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("block size must be positive")]
    ZeroBlockSize,
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Stable on-disk identity of a logical file name.
pub fn file_key(name: &str) -> String {
    sha256_hex(name.as_bytes())
}

/// Lowercase hex SHA-256 of a whole file, streamed from disk.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let mut reader = BufReader::new(File::open(path).await?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut buffer).await? {
            0 => break,
            n => hasher.update(&buffer[..n]),
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Rehashes a downloaded data file against its metadata's whole-file hash.
pub async fn verify_file(file: &MarkedFile) -> Result<bool, IntegrityError> {
    let actual = sha256_sum(file.data_path()).await?;
    if actual != file.metadata().hash {
        tracing::warn!(file = %file.id(), expected = %file.metadata().hash, %actual, "file hash mismatch");
        return Ok(false);
    }
    Ok(true)
}

/// Split `file` into blocks of `block_size`, hash each block and the whole
/// file, and describe it as metadata for `id`.
pub async fn describe_file(
    file: &Path,
    id: &str,
    url: &str,
    block_size: u64,
) -> Result<FileMetadata, IntegrityError> {
    if block_size == 0 {
        return Err(IntegrityError::ZeroBlockSize);
    }
    let mut reader = BufReader::new(File::open(file).await?);
    let mut whole = Sha256::new();
    let mut blocks = Vec::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let mut block_hasher = Sha256::new();
        let mut filled = 0u64;
        while filled < block_size {
            let want = (block_size - filled).min(buffer.len() as u64) as usize;
            let n = reader.read(&mut buffer[..want]).await?;
            if n == 0 {
                break;
            }
            whole.update(&buffer[..n]);
            block_hasher.update(&buffer[..n]);
            filled += n as u64;
        }
        if filled == 0 {
            break;
        }
        size += filled;
        blocks.push(BlockMeta {
            hash: format!("{:x}", block_hasher.finalize()),
            size: filled,
        });
        if filled < block_size {
            break;
        }
    }

    Ok(FileMetadata {
        name: id.to_string(),
        url: url.to_string(),
        size,
        hash: format!("{:x}", whole.finalize()),
        blocks,
    })
}

/// Write `<sha256(id)>.meta.json` for `file` into `out_dir`.
pub async fn create_meta_from_file(
    file: &Path,
    id: &str,
    out_dir: &Path,
    url: &str,
    block_size: u64,
) -> Result<PathBuf, IntegrityError> {
    let meta = describe_file(file, id, url, block_size).await?;
    tokio::fs::create_dir_all(out_dir).await?;
    let path = out_dir.join(format!("{}.meta.json", file_key(id)));
    tokio::fs::write(&path, serde_json::to_vec_pretty(&meta)?).await?;
    tracing::info!(id, blocks = meta.blocks.len(), size = meta.size, "metadata written");
    Ok(path)
}
