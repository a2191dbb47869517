// src/source/mod.rs

//! Block sources and the plumbing they share with the engine.
//!
//! Every source runs its own task. The engine talks to a source only through
//! its [`Assignment`] (lock-guarded block set plus wakeup) and hears back
//! through [`ComponentEvent`]s sent to its mailbox.

pub mod http;
pub mod peer;

use crate::file_manager::StoreError;
use crate::models::ProgressStatus;
use crate::transport::{PeerEndpoint, TransportError};
use crate::writer::{Block, MarkedFileWriter};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub use http::HttpSource;
pub use peer::PeerSource;

pub type ComponentId = u64;

/// Why a block was abandoned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block hash mismatch")]
    HashMismatch,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("storage failure: {0}")]
    Store(String),
    #[error("unknown failure")]
    Unknown,
}

impl From<StoreError> for BlockError {
    fn from(e: StoreError) -> Self {
        BlockError::Store(e.to_string())
    }
}

impl From<TransportError> for BlockError {
    fn from(e: TransportError) -> Self {
        BlockError::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for BlockError {
    fn from(e: reqwest::Error) -> Self {
        BlockError::Transport(e.to_string())
    }
}

/// Notifications from components, processed on the engine's control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentEvent {
    Started(ComponentId),
    Stopped(ComponentId),
    BlockCompleted {
        source: ComponentId,
        index: usize,
    },
    BlockFailed {
        source: ComponentId,
        index: usize,
        error: BlockError,
    },
    PeerFound(PeerEndpoint),
    PeerLost(PeerEndpoint),
}

pub type EventSender = mpsc::UnboundedSender<ComponentEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Http,
    Peer,
}

/// Anything the engine starts and stops.
///
/// `start` and `stop` are idempotent and return whether the component was
/// already in the requested state.
pub trait Component: Send + Sync {
    fn id(&self) -> ComponentId;
    fn start(&self) -> bool;
    fn stop(&self) -> bool;
}

/// A component that fetches assigned blocks into the writer.
pub trait BlockSource: Component {
    fn kind(&self) -> SourceKind;

    /// Where this source's bytes come from, recorded per completed block.
    fn origin(&self) -> String;

    /// Identity of the peer backing this source, if any.
    fn peer_id(&self) -> Option<&str> {
        None
    }

    fn assign_blocks(&self, blocks: &BTreeSet<usize>);

    fn unassign_blocks(&self, blocks: &BTreeSet<usize>);
}

/// The set of blocks a source may write, shared with the engine.
#[derive(Default)]
pub struct Assignment {
    blocks: Mutex<BTreeSet<usize>>,
    changed: Notify,
}

pub enum Wait {
    Block(usize),
    Idle,
    Cancelled,
}

impl Assignment {
    pub fn assign(&self, blocks: &BTreeSet<usize>) {
        self.blocks.lock().extend(blocks.iter().copied());
        self.changed.notify_one();
    }

    pub fn unassign(&self, blocks: &BTreeSet<usize>) {
        self.blocks.lock().retain(|i| !blocks.contains(i));
        self.changed.notify_one();
    }

    /// Drops `index` after the source is done with it, either way.
    pub fn finish(&self, index: usize) {
        self.blocks.lock().remove(&index);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.blocks.lock().contains(&index)
    }

    pub fn snapshot(&self) -> BTreeSet<usize> {
        self.blocks.lock().clone()
    }

    /// Waits until `pick` yields a block. With `idle` set, gives up after that
    /// long without work.
    pub async fn next(
        &self,
        cancel: &CancellationToken,
        pick: fn(&BTreeSet<usize>) -> Option<usize>,
        idle: Option<Duration>,
    ) -> Wait {
        loop {
            let changed = self.changed.notified();
            if cancel.is_cancelled() {
                return Wait::Cancelled;
            }
            if let Some(index) = pick(&self.blocks.lock()) {
                return Wait::Block(index);
            }
            match idle {
                Some(limit) => tokio::select! {
                    _ = cancel.cancelled() => return Wait::Cancelled,
                    _ = changed => {}
                    _ = tokio::time::sleep(limit) => return Wait::Idle,
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return Wait::Cancelled,
                    _ = changed => {}
                },
            }
        }
    }

    /// Appends `data` only while `block` is still assigned. The assignment
    /// lock is held across the write so an unassign cannot interleave.
    pub fn write_if_assigned(&self, block: &mut Block, data: &[u8]) -> Result<bool, StoreError> {
        let blocks = self.blocks.lock();
        if !blocks.contains(&block.index()) {
            return Ok(false);
        }
        block.append(data)?;
        Ok(true)
    }
}

pub fn lowest(blocks: &BTreeSet<usize>) -> Option<usize> {
    blocks.first().copied()
}

pub fn highest(blocks: &BTreeSet<usize>) -> Option<usize> {
    blocks.last().copied()
}

/// Start/stop bookkeeping for a task-backed component.
#[derive(Default)]
pub(crate) struct Lifecycle {
    running: Mutex<Option<CancellationToken>>,
}

impl Lifecycle {
    /// Spawns `task` unless already running. Returns true if it was.
    pub fn start<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return true;
        }
        let token = CancellationToken::new();
        tokio::spawn(task(token.clone()));
        *running = Some(token);
        false
    }

    /// Cancels the task. Returns true if nothing was running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(token) => {
                token.cancel();
                false
            }
            None => true,
        }
    }
}

/// Sleeps unless cancelled first; false on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

/// Maps a block on the blocking pool; mapping grows the data file on first use.
pub(crate) async fn open_block(writer: &Arc<MarkedFileWriter>, index: usize) -> Result<Block, StoreError> {
    let writer = writer.clone();
    tokio::task::spawn_blocking(move || writer.open_block(index)).await?
}

/// Flushes, verifies and closes a block on the blocking pool.
pub(crate) async fn close_block(block: Block) -> Result<ProgressStatus, StoreError> {
    tokio::task::spawn_blocking(move || block.close()).await?
}
