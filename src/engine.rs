// src/engine.rs

use crate::config::EngineConfig;
use crate::file_manager::{MarkedFile, StoreError};
use crate::finder::PeerFinder;
use crate::inspector::BlockInspector;
use crate::rebalance::{self, SourceLoad};
use crate::sharing::resource_query;
use crate::source::{
    BlockSource, Component, ComponentEvent, ComponentId, EventSender, HttpSource, PeerSource,
};
use crate::statistics::DownloadStatistics;
use crate::transport::{PeerEndpoint, PeerTransport, TransportError};
use crate::writer::MarkedFileWriter;
use reqwest::Client;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("resource is busy")]
    ResourceBusy,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("neither http nor peer discovery enabled")]
    NoSourceEnabled,
    #[error("file '{0}' is not registered")]
    NotRegistered(String),
    #[error("resource actor is gone")]
    ChannelClosed,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownloaderStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Stop in progress; start again once it completes.
    StartAfterStopped,
    /// Start in progress; stop once every component is up.
    StopAfterStarted,
}

/// Lifecycle notifications published to external listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started { file: String },
    BlockCompleted { file: String, index: usize },
    BlockFailed { file: String, index: usize, reason: String },
    Completed { file: String },
    Stopped { file: String },
}

/// Everything a component needs to join an engine.
pub struct SourceContext {
    pub id: ComponentId,
    pub writer: Arc<MarkedFileWriter>,
    pub stats: Arc<DownloadStatistics>,
    pub events: EventSender,
}

/// Builds the components an engine hatches.
pub trait ComponentFactory: Send + Sync {
    fn http_source(&self, ctx: SourceContext) -> Arc<dyn BlockSource>;
    fn peer_source(&self, ctx: SourceContext, peer: PeerEndpoint) -> Arc<dyn BlockSource>;
    fn peer_finder(&self, ctx: SourceContext) -> Arc<dyn Component>;
}

/// Real components: reqwest for the origin, the peer transport for the rest.
pub struct NetworkComponents {
    config: Arc<EngineConfig>,
    client: Client,
    transport: Arc<dyn PeerTransport>,
}

impl NetworkComponents {
    pub fn new(config: Arc<EngineConfig>, transport: Arc<dyn PeerTransport>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(config.http_timeout)
            .user_agent(concat!("blockshare/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            config,
            client,
            transport,
        })
    }
}

impl ComponentFactory for NetworkComponents {
    fn http_source(&self, ctx: SourceContext) -> Arc<dyn BlockSource> {
        Arc::new(HttpSource::new(
            ctx.id,
            self.client.clone(),
            ctx.writer,
            ctx.stats,
            ctx.events,
            &self.config,
        ))
    }

    fn peer_source(&self, ctx: SourceContext, peer: PeerEndpoint) -> Arc<dyn BlockSource> {
        Arc::new(PeerSource::new(
            ctx.id,
            peer,
            self.transport.clone(),
            ctx.writer,
            ctx.stats,
            ctx.events,
            &self.config,
        ))
    }

    fn peer_finder(&self, ctx: SourceContext) -> Arc<dyn Component> {
        let query = resource_query(&self.config.namespace, ctx.writer.file().key());
        Arc::new(PeerFinder::new(
            ctx.id,
            self.transport.clone(),
            query,
            ctx.events,
            self.config.discovery_interval,
            self.config.peer_timeout,
        ))
    }
}

enum Role {
    Source(Arc<dyn BlockSource>),
    Finder(Arc<dyn Component>),
}

impl Role {
    fn start(&self) -> bool {
        match self {
            Role::Source(s) => s.start(),
            Role::Finder(f) => f.start(),
        }
    }

    fn stop(&self) -> bool {
        match self {
            Role::Source(s) => s.stop(),
            Role::Finder(f) => f.stop(),
        }
    }

    fn peer_id(&self) -> Option<&str> {
        match self {
            Role::Source(s) => s.peer_id(),
            Role::Finder(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Hatched, waiting for its `Started` event.
    Eden,
    Active,
    Stopping,
}

struct Entry {
    role: Role,
    phase: Phase,
    assigned: BTreeSet<usize>,
}

impl Entry {
    fn release(&mut self) {
        if let Role::Source(s) = &self.role {
            s.unassign_blocks(&self.assigned);
        }
        self.assigned.clear();
    }

    fn retire(&mut self) {
        self.role.stop();
        self.phase = Phase::Stopping;
        self.release();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StartOptions {
    http: bool,
    peers: bool,
}

/// Per-file download state machine.
///
/// Not thread-safe on purpose: it lives on one control loop that feeds it
/// external commands and [`ComponentEvent`]s one at a time.
pub struct MainDownloader {
    file: Arc<MarkedFile>,
    factory: Arc<dyn ComponentFactory>,
    stats: Arc<DownloadStatistics>,
    inspector: Arc<BlockInspector>,
    events: broadcast::Sender<DownloadEvent>,
    mailbox: EventSender,
    status: DownloaderStatus,
    writer: Option<Arc<MarkedFileWriter>>,
    registry: BTreeMap<ComponentId, Entry>,
    next_id: ComponentId,
    options: StartOptions,
    completion_reported: bool,
}

impl MainDownloader {
    pub fn new(
        file: Arc<MarkedFile>,
        factory: Arc<dyn ComponentFactory>,
        stats: Arc<DownloadStatistics>,
        inspector: Arc<BlockInspector>,
        events: broadcast::Sender<DownloadEvent>,
        mailbox: EventSender,
    ) -> Self {
        Self {
            file,
            factory,
            stats,
            inspector,
            events,
            mailbox,
            status: DownloaderStatus::Stopped,
            writer: None,
            registry: BTreeMap::new(),
            next_id: 0,
            options: StartOptions::default(),
            completion_reported: false,
        }
    }

    pub fn status(&self) -> DownloaderStatus {
        self.status
    }

    pub fn file(&self) -> &Arc<MarkedFile> {
        &self.file
    }

    pub fn writer(&self) -> Option<&Arc<MarkedFileWriter>> {
        self.writer.as_ref()
    }

    pub fn statistics(&self) -> &Arc<DownloadStatistics> {
        &self.stats
    }

    /// Refreshes rolling speeds; driven by the monitor tick.
    pub fn tick(&self) {
        self.stats.update_speed();
    }

    /// Current origin → assigned blocks for active sources.
    pub fn distribution(&self) -> BTreeMap<String, BTreeSet<usize>> {
        let mut out: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for entry in self.registry.values() {
            if let (Role::Source(s), Phase::Active) = (&entry.role, entry.phase) {
                if !entry.assigned.is_empty() {
                    out.entry(s.origin()).or_default().extend(entry.assigned.iter().copied());
                }
            }
        }
        out
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    fn file_id(&self) -> String {
        self.file.id().to_string()
    }

    /// Returns true when already running.
    pub fn start(&mut self, http: bool, peers: bool) -> Result<bool, EngineError> {
        if !http && !peers {
            return Err(EngineError::NoSourceEnabled);
        }
        match self.status {
            DownloaderStatus::Running => return Ok(true),
            DownloaderStatus::Starting | DownloaderStatus::StartAfterStopped => return Ok(false),
            DownloaderStatus::StopAfterStarted => {
                self.status = DownloaderStatus::Starting;
                return Ok(false);
            }
            DownloaderStatus::Stopping => {
                self.options = StartOptions { http, peers };
                self.status = DownloaderStatus::StartAfterStopped;
                return Ok(false);
            }
            DownloaderStatus::Stopped => {}
        }
        self.options = StartOptions { http, peers };

        if self.file.is_complete() {
            tracing::info!(file = %self.file.id(), "file already complete");
            self.emit_already_complete();
            return Ok(false);
        }

        let writer = match self.file.try_open_writer() {
            Ok(writer) => Arc::new(writer),
            Err(StoreError::InUse) => return Err(EngineError::ResourceBusy),
            Err(e) => return Err(e.into()),
        };
        if writer.writable_blocks().is_empty() {
            writer.close()?;
            self.emit_already_complete();
            return Ok(false);
        }

        tracing::info!(file = %self.file.id(), http, peers, "download starting");
        self.writer = Some(writer);
        self.completion_reported = false;
        self.status = DownloaderStatus::Starting;
        if http {
            self.hatch(|factory, ctx| Role::Source(factory.http_source(ctx)));
        }
        if peers {
            self.hatch(|factory, ctx| Role::Finder(factory.peer_finder(ctx)));
        }
        Ok(false)
    }

    fn emit_already_complete(&self) {
        let file = self.file_id();
        self.emit(DownloadEvent::Started { file: file.clone() });
        self.emit(DownloadEvent::Completed { file: file.clone() });
        self.emit(DownloadEvent::Stopped { file });
    }

    /// Returns true when already stopped or stopping.
    pub fn stop(&mut self) -> bool {
        match self.status {
            DownloaderStatus::Stopped | DownloaderStatus::Stopping | DownloaderStatus::StopAfterStarted => true,
            DownloaderStatus::StartAfterStopped => {
                self.status = DownloaderStatus::Stopping;
                false
            }
            DownloaderStatus::Starting => {
                self.status = DownloaderStatus::StopAfterStarted;
                false
            }
            DownloaderStatus::Running => {
                self.stop_all();
                false
            }
        }
    }

    fn stop_all(&mut self) {
        tracing::info!(file = %self.file.id(), components = self.registry.len(), "download stopping");
        self.status = DownloaderStatus::Stopping;
        for entry in self.registry.values_mut() {
            if entry.phase != Phase::Stopping {
                entry.retire();
            }
        }
        if self.registry.is_empty() {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        let restart = self.status == DownloaderStatus::StartAfterStopped;
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.close() {
                tracing::warn!(file = %self.file.id(), error = %e, "failed to close writer");
            }
        }
        self.status = DownloaderStatus::Stopped;
        self.inspector.set_distribution(&BTreeMap::new());
        tracing::info!(file = %self.file.id(), "download stopped");
        self.emit(DownloadEvent::Stopped { file: self.file_id() });

        if restart {
            let StartOptions { http, peers } = self.options;
            if let Err(e) = self.start(http, peers) {
                tracing::warn!(file = %self.file.id(), error = %e, "restart after stop failed");
            }
        }
    }

    fn hatch(&mut self, build: impl FnOnce(&dyn ComponentFactory, SourceContext) -> Role) {
        let Some(writer) = self.writer.clone() else {
            return;
        };
        let id = self.next_id;
        self.next_id += 1;
        let ctx = SourceContext {
            id,
            writer,
            stats: self.stats.clone(),
            events: self.mailbox.clone(),
        };
        let role = build(self.factory.as_ref(), ctx);
        tracing::debug!(file = %self.file.id(), component = id, "component hatched");
        role.start();
        self.registry.insert(
            id,
            Entry {
                role,
                phase: Phase::Eden,
                assigned: BTreeSet::new(),
            },
        );
    }

    pub fn on_component_event(&mut self, event: ComponentEvent) {
        match event {
            ComponentEvent::Started(id) => self.on_started(id),
            ComponentEvent::Stopped(id) => self.on_stopped(id),
            ComponentEvent::BlockCompleted { source, index } => self.on_block_completed(source, index),
            ComponentEvent::BlockFailed { source, index, error } => {
                if let Some(entry) = self.registry.get_mut(&source) {
                    entry.assigned.remove(&index);
                    if let Role::Source(s) = &entry.role {
                        s.unassign_blocks(&BTreeSet::from([index]));
                    }
                }
                tracing::warn!(file = %self.file.id(), source, block = index, %error, "block failed");
                self.emit(DownloadEvent::BlockFailed {
                    file: self.file_id(),
                    index,
                    reason: error.to_string(),
                });
            }
            ComponentEvent::PeerFound(peer) => self.on_peer_found(peer),
            ComponentEvent::PeerLost(peer) => self.on_peer_lost(peer),
        }
    }

    fn eden_empty(&self) -> bool {
        self.registry.values().all(|e| e.phase != Phase::Eden)
    }

    fn on_started(&mut self, id: ComponentId) {
        let Some(entry) = self.registry.get_mut(&id) else {
            return;
        };
        if entry.phase != Phase::Eden {
            return;
        }
        entry.phase = Phase::Active;
        let is_source = matches!(entry.role, Role::Source(_));
        tracing::debug!(file = %self.file.id(), component = id, "component active");

        let status = self.status;
        match status {
            DownloaderStatus::Running if is_source => self.rebalance(),
            DownloaderStatus::Starting if self.eden_empty() => self.enter_running(),
            DownloaderStatus::StopAfterStarted if self.eden_empty() => self.stop_after_started(),
            _ => {}
        }
    }

    /// Every component came up after a stop was requested: announce the
    /// session so its `Stopped` is paired, then wind it down.
    fn stop_after_started(&mut self) {
        self.status = DownloaderStatus::Running;
        tracing::info!(file = %self.file.id(), "download started with a pending stop");
        self.emit(DownloadEvent::Started { file: self.file_id() });
        self.stop_all();
    }

    fn enter_running(&mut self) {
        self.status = DownloaderStatus::Running;
        self.stats.on_download_started();
        tracing::info!(file = %self.file.id(), "download running");
        self.emit(DownloadEvent::Started { file: self.file_id() });
        self.rebalance();
    }

    fn on_stopped(&mut self, id: ComponentId) {
        let Some(entry) = self.registry.remove(&id) else {
            return;
        };
        tracing::debug!(file = %self.file.id(), component = id, "component stopped");
        let held_blocks = matches!(entry.role, Role::Source(_)) && !entry.assigned.is_empty();

        if self.registry.is_empty() {
            match self.status {
                DownloaderStatus::Stopped => {}
                DownloaderStatus::Stopping | DownloaderStatus::StartAfterStopped => self.finish_stop(),
                DownloaderStatus::Running | DownloaderStatus::Starting | DownloaderStatus::StopAfterStarted => {
                    tracing::warn!(file = %self.file.id(), "every component is gone, forcing stop");
                    self.finish_stop();
                }
            }
            return;
        }

        let status = self.status;
        match status {
            DownloaderStatus::Running if held_blocks => self.rebalance(),
            DownloaderStatus::Starting if self.eden_empty() => self.enter_running(),
            DownloaderStatus::StopAfterStarted if self.eden_empty() => self.stop_after_started(),
            _ => {}
        }
    }

    fn on_block_completed(&mut self, source: ComponentId, index: usize) {
        let mut origin = None;
        if let Some(entry) = self.registry.get_mut(&source) {
            entry.assigned.remove(&index);
            if let Role::Source(s) = &entry.role {
                s.unassign_blocks(&BTreeSet::from([index]));
                origin = Some(s.origin());
            }
        }
        if let Some(origin) = origin {
            if let Err(e) = self.inspector.record_downloaded(index, &origin) {
                tracing::warn!(file = %self.file.id(), block = index, error = %e, "failed to record block origin");
            }
        }
        tracing::debug!(file = %self.file.id(), source, block = index, "block completed");
        self.emit(DownloadEvent::BlockCompleted {
            file: self.file_id(),
            index,
        });

        let remaining = self.writer.as_ref().map(|w| w.writable_blocks().len());
        if remaining == Some(0) {
            // Several sources may finish their last blocks before this loop
            // sees the first completion.
            if std::mem::replace(&mut self.completion_reported, true) {
                return;
            }
            tracing::info!(file = %self.file.id(), "download complete");
            self.emit(DownloadEvent::Completed { file: self.file_id() });
            self.stop();
        } else if self.status == DownloaderStatus::Running {
            self.rebalance();
        }
    }

    fn on_peer_found(&mut self, peer: PeerEndpoint) {
        if !matches!(self.status, DownloaderStatus::Starting | DownloaderStatus::Running) {
            return;
        }
        let known = self
            .registry
            .values()
            .any(|e| e.phase != Phase::Stopping && e.role.peer_id() == Some(peer.id.as_str()));
        if known {
            return;
        }
        tracing::info!(file = %self.file.id(), peer = %peer.id, "adding peer source");
        self.hatch(move |factory, ctx| Role::Source(factory.peer_source(ctx, peer)));
    }

    fn on_peer_lost(&mut self, peer: PeerEndpoint) {
        let mut retired = false;
        for entry in self.registry.values_mut() {
            if entry.phase != Phase::Stopping && entry.role.peer_id() == Some(peer.id.as_str()) {
                entry.retire();
                retired = true;
            }
        }
        if retired {
            tracing::info!(file = %self.file.id(), peer = %peer.id, "peer source retired");
            if self.status == DownloaderStatus::Running {
                self.rebalance();
            }
        }
    }

    fn rebalance(&mut self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let writable = writer.writable_blocks();
        let loads: Vec<SourceLoad> = self
            .registry
            .iter()
            .filter_map(|(id, e)| match (&e.role, e.phase) {
                (Role::Source(s), Phase::Active) => Some(SourceLoad {
                    id: *id,
                    kind: s.kind(),
                    assigned: e.assigned.clone(),
                }),
                _ => None,
            })
            .collect();

        let plan = rebalance::plan(&writable, &loads);
        for (id, blocks) in &plan.unassign {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.assigned.retain(|i| !blocks.contains(i));
                if let Role::Source(s) = &entry.role {
                    s.unassign_blocks(blocks);
                }
            }
        }
        for (id, blocks) in &plan.assign {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.assigned.extend(blocks.iter().copied());
                if let Role::Source(s) = &entry.role {
                    s.assign_blocks(blocks);
                }
            }
        }
        if !plan.is_empty() {
            tracing::debug!(
                file = %self.file.id(),
                sources = loads.len(),
                writable = writable.len(),
                "blocks rebalanced"
            );
        }
        self.inspector.set_distribution(&self.distribution());
    }
}
