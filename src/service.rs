// src/service.rs

use crate::config::EngineConfig;
use crate::engine::{ComponentFactory, DownloadEvent, DownloaderStatus, EngineError, NetworkComponents};
use crate::file_manager::FileManager;
use crate::inspector::BlockInspection;
use crate::resource::{spawn_resource, ResourceHandle, Result};
use crate::statistics::FileStatistics;
use crate::transport::PeerTransport;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Control surface over every registered file.
pub struct ResService {
    config: Arc<EngineConfig>,
    files: FileManager,
    factory: Arc<dyn ComponentFactory>,
    transport: Arc<dyn PeerTransport>,
    resources: Mutex<HashMap<String, (ResourceHandle, JoinHandle<()>)>>,
    events: broadcast::Sender<DownloadEvent>,
}

impl ResService {
    pub fn new(config: EngineConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let config = Arc::new(config);
        let factory = Arc::new(NetworkComponents::new(config.clone(), transport.clone())?);
        Ok(Self::with_factory(config, transport, factory))
    }

    pub fn with_factory(
        config: Arc<EngineConfig>,
        transport: Arc<dyn PeerTransport>,
        factory: Arc<dyn ComponentFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            files: FileManager::new(config.data_dir.clone()),
            config,
            factory,
            transport,
            resources: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lifecycle events of every file, in order per file.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Loads the metadata of `file_id` and spawns its actor. Idempotent.
    pub async fn register(&self, file_id: &str) -> Result<()> {
        let mut resources = self.resources.lock().await;
        if resources.contains_key(file_id) {
            return Ok(());
        }
        let file = self.files.get_file(file_id)?;
        let entry = spawn_resource(
            file,
            self.config.clone(),
            self.factory.clone(),
            self.transport.clone(),
            self.events.clone(),
        );
        resources.insert(file_id.to_string(), entry);
        tracing::info!(file = file_id, "resource registered");
        Ok(())
    }

    async fn handle(&self, file_id: &str) -> Result<ResourceHandle> {
        self.resources
            .lock()
            .await
            .get(file_id)
            .map(|(handle, _)| handle.clone())
            .ok_or_else(|| EngineError::NotRegistered(file_id.to_string()))
    }

    /// Returns true when the download was already running.
    pub async fn start_download(&self, file_id: &str, enable_http: bool, enable_peers: bool) -> Result<bool> {
        self.handle(file_id).await?.start(enable_http, enable_peers).await
    }

    /// Returns true when the download was already stopped or stopping.
    pub async fn stop_download(&self, file_id: &str) -> Result<bool> {
        self.handle(file_id).await?.stop().await
    }

    /// Deletes downloaded data, progress and inspection records.
    pub async fn clear_resource(&self, file_id: &str) -> Result<()> {
        self.handle(file_id).await?.clear().await
    }

    /// Returns true when sharing was already in the requested state.
    pub async fn set_sharing(&self, file_id: &str, enabled: bool) -> Result<bool> {
        self.handle(file_id).await?.set_sharing(enabled).await
    }

    pub async fn get_statistics(&self, file_id: &str) -> Result<FileStatistics> {
        self.handle(file_id).await?.statistics().await
    }

    pub async fn get_block_inspection(&self, file_id: &str) -> Result<BTreeMap<usize, BlockInspection>> {
        self.handle(file_id).await?.inspection().await
    }

    pub async fn status(&self, file_id: &str) -> Result<DownloaderStatus> {
        self.handle(file_id).await?.status().await
    }

    /// Stops every download, withdraws every share and waits for the actors.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.resources.lock().await.drain().collect();
        for (id, (handle, join)) in drained {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!(file = %id, error = %e, "resource shutdown failed");
            }
            let _ = join.await;
        }
    }
}
