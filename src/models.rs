// src/models.rs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declared hash and length of a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub hash: String,
    pub size: u64,
}

/// Immutable description of a managed file, loaded once from `<hash>.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Logical id of the file. Its SHA-256 names every on-disk artifact.
    pub name: String,
    pub url: String,
    pub size: u64,
    pub hash: String,
    pub blocks: Vec<BlockMeta>,
}

impl FileMetadata {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Absolute offset of block `index` in the file.
    pub fn block_offset(&self, index: usize) -> u64 {
        self.blocks[..index].iter().map(|b| b.size).sum()
    }

    pub fn block_size(&self, index: usize) -> u64 {
        self.blocks[index].size
    }

    /// True when the blocks exactly tile `[0, size)`.
    pub fn is_tiled(&self) -> bool {
        self.blocks.iter().map(|b| b.size).sum::<u64>() == self.size
            && self.blocks.iter().all(|b| b.size > 0)
    }

    pub fn all_blocks(&self) -> BTreeSet<usize> {
        (0..self.blocks.len()).collect()
    }
}

/// State of a block that is open or was left mid-write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    HashMismatch,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockProgress {
    pub progress: u64,
    pub status: ProgressStatus,
}

/// The persisted progress record, `<hash>.prog.json`.
///
/// An index is never in both `completed_blocks` and `other_blocks`, and
/// `completed` implies `other_blocks` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_blocks: BTreeSet<usize>,
    #[serde(default, rename = "other_blocks")]
    pub partial: BTreeMap<usize, BlockProgress>,
}

impl ProgressRecord {
    pub fn with_block_complete(mut self, index: usize) -> Self {
        self.partial.remove(&index);
        self.completed_blocks.insert(index);
        self
    }

    pub fn with_status(mut self, index: usize, progress: BlockProgress) -> Self {
        self.completed_blocks.remove(&index);
        self.partial.insert(index, progress);
        self
    }

    pub fn with_all_complete(mut self) -> Self {
        self.partial.clear();
        self.completed = true;
        self
    }

    pub fn progress_of(&self, index: usize) -> Option<BlockProgress> {
        self.partial.get(&index).copied()
    }

    /// Bytes known to be on disk: completed blocks plus partial cursors.
    pub fn downloaded_bytes(&self, metadata: &FileMetadata) -> u64 {
        let done: u64 = self
            .completed_blocks
            .iter()
            .filter_map(|i| metadata.blocks.get(*i))
            .map(|b| b.size)
            .sum();
        let partial: u64 = self
            .partial
            .values()
            .filter(|p| p.status == ProgressStatus::Downloading)
            .map(|p| p.progress)
            .sum();
        done + partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metadata_from_sizes(sizes: &[u64]) -> FileMetadata {
        FileMetadata {
            name: "test".into(),
            url: String::new(),
            size: sizes.iter().sum(),
            hash: String::new(),
            blocks: sizes
                .iter()
                .map(|s| BlockMeta {
                    hash: String::new(),
                    size: *s,
                })
                .collect(),
        }
    }

    proptest! {
        #[test]
        fn block_offsets_are_prefix_sums(sizes in proptest::collection::vec(1u64..5_000_000, 1..64)) {
            let meta = metadata_from_sizes(&sizes);
            prop_assert!(meta.is_tiled());
            let mut expected = 0u64;
            for (i, size) in sizes.iter().enumerate() {
                prop_assert_eq!(meta.block_offset(i), expected);
                expected += size;
            }
            prop_assert_eq!(expected, meta.size);
        }
    }

    #[test]
    fn progress_file_uses_wire_names() {
        let record = ProgressRecord::default()
            .with_block_complete(0)
            .with_status(
                2,
                BlockProgress {
                    progress: 42,
                    status: ProgressStatus::Downloading,
                },
            );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["completed"], false);
        assert_eq!(json["completed_blocks"], serde_json::json!([0]));
        assert_eq!(json["other_blocks"]["2"]["progress"], 42);
        assert_eq!(json["other_blocks"]["2"]["status"], "Downloading");

        let back: ProgressRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn completing_a_partial_block_moves_it() {
        let record = ProgressRecord::default()
            .with_status(
                1,
                BlockProgress {
                    progress: 10,
                    status: ProgressStatus::Downloading,
                },
            )
            .with_block_complete(1);
        assert!(record.partial.is_empty());
        assert!(record.completed_blocks.contains(&1));
    }
}
