// src/source/peer.rs

use super::{
    close_block, highest, open_block, pause, Assignment, BlockError, BlockSource, Component,
    ComponentEvent, ComponentId, EventSender, Lifecycle, SourceKind, Wait,
};
use crate::config::EngineConfig;
use crate::file_manager::StoreError;
use crate::models::ProgressStatus;
use crate::statistics::DownloadStatistics;
use crate::transport::{format_range, Command, PeerEndpoint, PeerRequest, PeerResponse, PeerTransport};
use crate::writer::{Block, MarkedFileWriter};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUSY_RETRY: Duration = Duration::from_millis(20);

/// Fetches blocks from one discovered peer, highest index first, so it meets
/// the HTTP source from the other end of the file.
pub struct PeerSource {
    inner: Arc<PeerInner>,
    lifecycle: Lifecycle,
}

struct PeerInner {
    id: ComponentId,
    peer: PeerEndpoint,
    transport: Arc<dyn PeerTransport>,
    writer: Arc<MarkedFileWriter>,
    stats: Arc<DownloadStatistics>,
    events: EventSender,
    assignment: Assignment,
    chunk_size: usize,
    poll_interval: Duration,
}

enum Fill {
    Complete,
    Unassigned,
    Cancelled,
}

impl PeerSource {
    pub fn new(
        id: ComponentId,
        peer: PeerEndpoint,
        transport: Arc<dyn PeerTransport>,
        writer: Arc<MarkedFileWriter>,
        stats: Arc<DownloadStatistics>,
        events: EventSender,
        config: &EngineConfig,
    ) -> Self {
        let chunk_size = if peer.reliable {
            config.peer_chunk_reliable
        } else {
            config.peer_chunk_unreliable
        };
        Self {
            inner: Arc::new(PeerInner {
                id,
                peer,
                transport,
                writer,
                stats,
                events,
                assignment: Assignment::default(),
                chunk_size: chunk_size.max(1),
                poll_interval: config.peer_poll_interval,
            }),
            lifecycle: Lifecycle::default(),
        }
    }
}

impl Component for PeerSource {
    fn id(&self) -> ComponentId {
        self.inner.id
    }

    fn start(&self) -> bool {
        let inner = self.inner.clone();
        self.lifecycle.start(move |cancel| inner.run(cancel))
    }

    fn stop(&self) -> bool {
        self.lifecycle.stop()
    }
}

impl BlockSource for PeerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Peer
    }

    fn origin(&self) -> String {
        format!("{}{}", self.inner.peer.host, self.inner.peer.base_uri)
    }

    fn peer_id(&self) -> Option<&str> {
        Some(&self.inner.peer.id)
    }

    fn assign_blocks(&self, blocks: &BTreeSet<usize>) {
        self.inner.assignment.assign(blocks);
    }

    fn unassign_blocks(&self, blocks: &BTreeSet<usize>) {
        self.inner.assignment.unassign(blocks);
    }
}

impl PeerInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(source = self.id, peer = %self.peer.id, "peer source started");
        let _ = self.events.send(ComponentEvent::Started(self.id));

        loop {
            let index = match self.assignment.next(&cancel, highest, None).await {
                Wait::Block(index) => index,
                Wait::Idle => continue,
                Wait::Cancelled => break,
            };

            let mut block = match open_block(&self.writer, index).await {
                Ok(block) => block,
                Err(StoreError::BlockAlreadyOpen(_)) => {
                    if !pause(&cancel, BUSY_RETRY).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    self.fail(index, e.into());
                    continue;
                }
            };

            match self.fill(&mut block, &cancel).await {
                Ok(Fill::Complete) => self.finish(block).await,
                Ok(Fill::Unassigned) => self.close_quietly(block).await,
                Ok(Fill::Cancelled) => {
                    self.close_quietly(block).await;
                    break;
                }
                Err(error) => {
                    tracing::warn!(source = self.id, peer = %self.peer.id, block = index, %error, "peer block failed");
                    self.close_quietly(block).await;
                    self.fail(index, error);
                }
            }
        }

        tracing::debug!(source = self.id, peer = %self.peer.id, "peer source stopped");
        let _ = self.events.send(ComponentEvent::Stopped(self.id));
    }

    async fn fill(&self, block: &mut Block, cancel: &CancellationToken) -> Result<Fill, BlockError> {
        let index = block.index();
        while block.remain() > 0 {
            if !self.assignment.contains(index) {
                return Ok(Fill::Unassigned);
            }
            let len = block.remain().min(self.chunk_size);
            let range = format_range(block.cursor() as u64, len);
            let request = PeerRequest {
                base_uri: self.peer.base_uri.clone(),
                block: Some(index),
                command: Command::Data,
                range: Some(range.clone()),
            };

            let reply = self.transport.get(&self.peer, request);
            tokio::pin!(reply);
            let mut poll = tokio::time::interval(self.poll_interval);
            let response = loop {
                tokio::select! {
                    response = &mut reply => break response?,
                    _ = cancel.cancelled() => return Ok(Fill::Cancelled),
                    _ = poll.tick() => {
                        if !self.assignment.contains(index) {
                            return Ok(Fill::Unassigned);
                        }
                    }
                }
            };

            let data = match response {
                PeerResponse::Data { range: echoed, data } => {
                    if echoed != range {
                        return Err(BlockError::ProtocolViolation(format!(
                            "asked for range {range}, got {echoed}"
                        )));
                    }
                    if data.len() != len {
                        return Err(BlockError::ProtocolViolation(format!(
                            "asked for {len} bytes, got {}",
                            data.len()
                        )));
                    }
                    data
                }
                other => {
                    return Err(BlockError::ProtocolViolation(format!(
                        "unexpected reply to data request: {other:?}"
                    )))
                }
            };

            if !self.assignment.write_if_assigned(block, &data)? {
                return Ok(Fill::Unassigned);
            }
            self.stats.on_peer_downloaded(len);
        }
        Ok(Fill::Complete)
    }

    async fn finish(&self, block: Block) {
        let index = block.index();
        match close_block(block).await {
            Ok(ProgressStatus::Completed) => {
                self.assignment.finish(index);
                self.stats.on_peer_block_downloaded();
                let _ = self.events.send(ComponentEvent::BlockCompleted {
                    source: self.id,
                    index,
                });
            }
            Ok(ProgressStatus::HashMismatch) => self.fail(index, BlockError::HashMismatch),
            Ok(ProgressStatus::Downloading) => self.fail(index, BlockError::Unknown),
            Err(e) => self.fail(index, e.into()),
        }
    }

    async fn close_quietly(&self, block: Block) {
        let index = block.index();
        if let Err(e) = close_block(block).await {
            tracing::warn!(source = self.id, block = index, error = %e, "failed to close block");
        }
    }

    fn fail(&self, index: usize, error: BlockError) {
        self.assignment.finish(index);
        let _ = self.events.send(ComponentEvent::BlockFailed {
            source: self.id,
            index,
            error,
        });
    }
}
