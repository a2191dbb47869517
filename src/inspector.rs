// src/inspector.rs

use crate::file_manager::StoreError;
use crate::progress_store::{load_json, save_json_atomic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Persisted origin of a completed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOrigin {
    pub url: String,
}

/// What is known about one block: who completed it and who holds it now.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockInspection {
    pub url: Option<String>,
    pub distributed: Option<String>,
    pub downloaded: bool,
}

/// Tracks where blocks came from (`<hash>.insp.json`) and where they are
/// currently assigned.
pub struct BlockInspector {
    path: PathBuf,
    state: Mutex<InspectorState>,
}

#[derive(Default)]
struct InspectorState {
    loaded: bool,
    downloaded: BTreeMap<usize, BlockOrigin>,
    distribution: BTreeMap<usize, String>,
    revision: u64,
    saved: u64,
}

impl BlockInspector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(InspectorState::default()),
        }
    }

    fn ensure_loaded(&self, state: &mut InspectorState) -> Result<(), StoreError> {
        if !state.loaded {
            state.downloaded = load_json(&self.path)?.unwrap_or_default();
            state.loaded = true;
        }
        Ok(())
    }

    /// Records the origin of a completed block. Inside a runtime the file is
    /// rewritten on the blocking pool; the in-memory view is updated at once.
    pub fn record_downloaded(self: &Arc<Self>, index: usize, url: &str) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            self.ensure_loaded(&mut state)?;
            state.downloaded.insert(index, BlockOrigin { url: url.to_string() });
            state.revision += 1;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let this = self.clone();
                runtime.spawn_blocking(move || {
                    if let Err(e) = this.persist() {
                        tracing::warn!(path = %this.path.display(), error = %e, "failed to persist block origins");
                    }
                });
                Ok(())
            }
            Err(_) => self.persist(),
        }
    }

    /// Writes the origins to disk unless nothing changed since the last write.
    pub fn persist(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.saved == state.revision {
            return Ok(());
        }
        save_json_atomic(&self.path, &state.downloaded)?;
        state.saved = state.revision;
        Ok(())
    }

    /// Replaces the live view of which origin holds which blocks.
    pub fn set_distribution(&self, by_origin: &BTreeMap<String, BTreeSet<usize>>) {
        let mut state = self.state.lock();
        state.distribution = by_origin
            .iter()
            .flat_map(|(origin, blocks)| blocks.iter().map(move |i| (*i, origin.clone())))
            .collect();
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        *state = InspectorState {
            loaded: true,
            ..InspectorState::default()
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn inspections(&self) -> Result<BTreeMap<usize, BlockInspection>, StoreError> {
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state)?;
        let mut out: BTreeMap<usize, BlockInspection> = BTreeMap::new();
        for (index, origin) in &state.downloaded {
            let entry = out.entry(*index).or_default();
            entry.url = Some(origin.url.clone());
            entry.downloaded = true;
        }
        for (index, origin) in &state.distribution {
            out.entry(*index).or_default().distributed = Some(origin.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_persist_and_merge_with_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.insp.json");
        let inspector = Arc::new(BlockInspector::new(&path));
        inspector.record_downloaded(0, "http://origin/file").unwrap();
        inspector.set_distribution(&BTreeMap::from([(
            "peer-a".to_string(),
            BTreeSet::from([1, 2]),
        )]));

        let view = inspector.inspections().unwrap();
        assert_eq!(view[&0].url.as_deref(), Some("http://origin/file"));
        assert!(view[&0].downloaded);
        assert_eq!(view[&2].distributed.as_deref(), Some("peer-a"));
        assert!(!view[&2].downloaded);

        let on_disk: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["0"]["url"], "http://origin/file");

        let reopened = BlockInspector::new(&path);
        assert_eq!(reopened.inspections().unwrap().len(), 1);

        reopened.clear().unwrap();
        assert!(reopened.inspections().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn origins_are_written_off_the_caller_and_not_resurrected_by_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.insp.json");
        let inspector = Arc::new(BlockInspector::new(&path));
        inspector.record_downloaded(3, "http://origin/file").unwrap();
        assert_eq!(inspector.inspections().unwrap()[&3].url.as_deref(), Some("http://origin/file"));

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        inspector.record_downloaded(4, "http://origin/file").unwrap();
        inspector.clear().unwrap();
        inspector.persist().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!path.exists());
        assert!(inspector.inspections().unwrap().is_empty());
    }
}
