// src/resource.rs

//! One actor task per registered file.
//!
//! The actor owns the file's [`MainDownloader`] and its sharing state, and is
//! the single context where external commands, component events and the
//! statistics tick are applied.

use crate::config::EngineConfig;
use crate::engine::{ComponentFactory, DownloadEvent, DownloaderStatus, EngineError, MainDownloader};
use crate::file_manager::{MarkedFile, StoreError};
use crate::inspector::{BlockInspection, BlockInspector};
use crate::sharing::SharedFile;
use crate::source::ComponentEvent;
use crate::statistics::{DownloadStatistics, FileStatistics, UploadStatistics};
use crate::transport::{PeerTransport, ResourceHandler};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Upper bound on waiting for components to wind down at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug)]
pub enum ResourceCommand {
    Start {
        http: bool,
        peers: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Clear {
        reply: oneshot::Sender<Result<()>>,
    },
    SetSharing {
        enabled: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    Statistics {
        reply: oneshot::Sender<FileStatistics>,
    },
    Inspection {
        reply: oneshot::Sender<Result<BTreeMap<usize, BlockInspection>>>,
    },
    Status {
        reply: oneshot::Sender<DownloaderStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ResourceHandle {
    tx: mpsc::Sender<ResourceCommand>,
}

impl ResourceHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ResourceCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn start(&self, http: bool, peers: bool) -> Result<bool> {
        self.call(|reply| ResourceCommand::Start { http, peers, reply }).await?
    }

    pub async fn stop(&self) -> Result<bool> {
        self.call(|reply| ResourceCommand::Stop { reply }).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.call(|reply| ResourceCommand::Clear { reply }).await?
    }

    pub async fn set_sharing(&self, enabled: bool) -> Result<bool> {
        self.call(|reply| ResourceCommand::SetSharing { enabled, reply }).await?
    }

    pub async fn statistics(&self) -> Result<FileStatistics> {
        self.call(|reply| ResourceCommand::Statistics { reply }).await
    }

    pub async fn inspection(&self) -> Result<BTreeMap<usize, BlockInspection>> {
        self.call(|reply| ResourceCommand::Inspection { reply }).await?
    }

    pub async fn status(&self) -> Result<DownloaderStatus> {
        self.call(|reply| ResourceCommand::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| ResourceCommand::Shutdown { reply }).await
    }
}

/// Spawns the actor for `file`.
pub fn spawn_resource(
    file: Arc<MarkedFile>,
    config: Arc<EngineConfig>,
    factory: Arc<dyn ComponentFactory>,
    transport: Arc<dyn PeerTransport>,
    events: broadcast::Sender<DownloadEvent>,
) -> (ResourceHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let inspector = Arc::new(BlockInspector::new(file.companion_path("insp.json")));
    let engine = MainDownloader::new(
        file.clone(),
        factory,
        Arc::new(DownloadStatistics::new(config.speed_window)),
        inspector.clone(),
        events,
        mailbox_tx,
    );
    let actor = ResourceActor {
        upload: Arc::new(UploadStatistics::new(config.speed_window)),
        shared: None,
        file,
        engine,
        inspector,
        transport,
        config,
    };
    let join = tokio::spawn(actor.run(rx, mailbox_rx));
    (ResourceHandle { tx }, join)
}

struct ResourceActor {
    file: Arc<MarkedFile>,
    engine: MainDownloader,
    inspector: Arc<BlockInspector>,
    upload: Arc<UploadStatistics>,
    transport: Arc<dyn PeerTransport>,
    config: Arc<EngineConfig>,
    shared: Option<Arc<SharedFile>>,
}

impl ResourceActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ResourceCommand>,
        mut mailbox: mpsc::UnboundedReceiver<ComponentEvent>,
    ) {
        let mut monitor = tokio::time::interval(self.config.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(file = %self.file.id(), "resource actor started");

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ResourceCommand::Shutdown { reply }) => {
                        self.shutdown(&mut mailbox).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        self.shutdown(&mut mailbox).await;
                        break;
                    }
                },
                Some(event) = mailbox.recv() => self.engine.on_component_event(event),
                _ = monitor.tick() => {
                    self.engine.tick();
                    self.upload.update_speed();
                }
            }
        }
        tracing::debug!(file = %self.file.id(), "resource actor stopped");
    }

    async fn handle(&mut self, cmd: ResourceCommand) {
        match cmd {
            ResourceCommand::Start { http, peers, reply } => {
                let _ = reply.send(self.engine.start(http, peers));
            }
            ResourceCommand::Stop { reply } => {
                let _ = reply.send(self.engine.stop());
            }
            ResourceCommand::Clear { reply } => {
                let _ = reply.send(self.clear().await);
            }
            ResourceCommand::SetSharing { enabled, reply } => {
                let _ = reply.send(self.set_sharing(enabled));
            }
            ResourceCommand::Statistics { reply } => {
                let _ = reply.send(FileStatistics {
                    download: self.engine.statistics().snapshot(),
                    upload: self.upload.snapshot(),
                });
            }
            ResourceCommand::Inspection { reply } => {
                let _ = reply.send(self.inspector.inspections().map_err(EngineError::from));
            }
            ResourceCommand::Status { reply } => {
                let _ = reply.send(self.engine.status());
            }
            // Intercepted by the run loop, which also drains the mailbox.
            ResourceCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn clear(&mut self) -> Result<()> {
        if self.engine.status() != DownloaderStatus::Stopped {
            return Err(EngineError::InvalidState(format!(
                "cannot clear while {:?}",
                self.engine.status()
            )));
        }
        let writer = self.file.try_open_writer().map_err(|e| match e {
            StoreError::InUse => EngineError::ResourceBusy,
            other => EngineError::Store(other),
        })?;
        self.set_sharing(false)?;
        let inspector = self.inspector.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), StoreError> {
            writer.clear_file()?;
            writer.close()?;
            inspector.clear()
        })
        .await
        .map_err(StoreError::from)??;
        tracing::info!(file = %self.file.id(), "resource cleared");
        Ok(())
    }

    /// Returns true when sharing was already in the requested state.
    fn set_sharing(&mut self, enabled: bool) -> Result<bool> {
        if !enabled {
            return Ok(match self.shared.take() {
                Some(shared) => {
                    self.transport.unpublish(shared.base_uri());
                    tracing::info!(file = %self.file.id(), "sharing stopped");
                    false
                }
                None => true,
            });
        }
        if self.shared.is_some() {
            return Ok(true);
        }
        if !self.file.is_complete() {
            return Err(EngineError::InvalidState("only complete files can be shared".into()));
        }
        let shared = Arc::new(SharedFile::new(
            self.file.clone(),
            self.upload.clone(),
            &self.config.namespace,
        ));
        self.upload.reset();
        self.transport.publish(shared.clone())?;
        tracing::info!(file = %self.file.id(), uri = %shared.base_uri(), "sharing started");
        self.shared = Some(shared);
        Ok(false)
    }

    /// Stops sharing and the download, applying component events until the
    /// engine has released the file or the grace period runs out.
    async fn shutdown(&mut self, mailbox: &mut mpsc::UnboundedReceiver<ComponentEvent>) {
        if let Err(e) = self.set_sharing(false) {
            tracing::warn!(file = %self.file.id(), error = %e, "failed to stop sharing");
        }
        self.engine.stop();
        let engine = &mut self.engine;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while engine.status() != DownloaderStatus::Stopped {
                match mailbox.recv().await {
                    Some(event) => engine.on_component_event(event),
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(file = %self.file.id(), status = ?self.engine.status(), "components did not stop in time");
        }
    }
}
