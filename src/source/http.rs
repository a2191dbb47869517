// src/source/http.rs

use super::{
    close_block, lowest, open_block, pause, Assignment, BlockError, BlockSource, Component,
    ComponentEvent, ComponentId, EventSender, Lifecycle, SourceKind, Wait,
};
use crate::config::EngineConfig;
use crate::file_manager::StoreError;
use crate::models::ProgressStatus;
use crate::statistics::DownloadStatistics;
use crate::writer::{Block, MarkedFileWriter};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUSY_RETRY: Duration = Duration::from_millis(20);

/// Fetches blocks from the file's origin URL, lowest index first, over one
/// ranged stream that is reused while blocks stay contiguous.
pub struct HttpSource {
    inner: Arc<HttpInner>,
    lifecycle: Lifecycle,
}

struct HttpInner {
    id: ComponentId,
    url: String,
    client: Client,
    writer: Arc<MarkedFileWriter>,
    stats: Arc<DownloadStatistics>,
    events: EventSender,
    assignment: Assignment,
    read_size: usize,
    idle_linger: Duration,
}

/// An open ranged response and how far into the file it has been read.
struct Session {
    stream: BoxStream<'static, reqwest::Result<Bytes>>,
    position: u64,
    pending: Bytes,
}

enum Fill {
    Complete,
    Unassigned,
    Cancelled,
}

impl HttpSource {
    pub fn new(
        id: ComponentId,
        client: Client,
        writer: Arc<MarkedFileWriter>,
        stats: Arc<DownloadStatistics>,
        events: EventSender,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HttpInner {
                id,
                url: writer.metadata().url.clone(),
                client,
                writer,
                stats,
                events,
                assignment: Assignment::default(),
                read_size: config.http_read_size.max(1),
                idle_linger: config.http_idle_linger,
            }),
            lifecycle: Lifecycle::default(),
        }
    }
}

impl Component for HttpSource {
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

impl BlockSource for HttpSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Http
    }

    fn origin(&self) -> String {
        self.inner.url.clone()
    }

    fn assign_blocks(&self, blocks: &BTreeSet<usize>) {
        self.inner.assignment.assign(blocks);
    }

    fn unassign_blocks(&self, blocks: &BTreeSet<usize>) {
        self.inner.assignment.unassign(blocks);
    }
}

impl HttpInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!(source = self.id, url = %self.url, "http source started");
        let _ = self.events.send(ComponentEvent::Started(self.id));

        let mut session: Option<Session> = None;
        loop {
            let idle = session.as_ref().map(|_| self.idle_linger);
            let index = match self.assignment.next(&cancel, lowest, idle).await {
                Wait::Block(index) => index,
                Wait::Idle => {
                    tracing::trace!(source = self.id, "closing idle http session");
                    session = None;
                    continue;
                }
                Wait::Cancelled => break,
            };

            let mut block = match open_block(&self.writer, index).await {
                Ok(block) => block,
                Err(StoreError::BlockAlreadyOpen(_)) => {
                    // Still held by the source it was taken from.
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

            match self.fill(&mut block, &mut session, &cancel).await {
                Ok(Fill::Complete) => self.finish(block).await,
                Ok(Fill::Unassigned) => {
                    session = None;
                    self.close_quietly(block).await;
                }
                Ok(Fill::Cancelled) => {
                    self.close_quietly(block).await;
                    break;
                }
                Err(error) => {
                    tracing::warn!(source = self.id, block = index, %error, "http block failed");
                    session = None;
                    self.close_quietly(block).await;
                    self.fail(index, error);
                }
            }
        }

        drop(session);
        tracing::debug!(source = self.id, "http source stopped");
        let _ = self.events.send(ComponentEvent::Stopped(self.id));
    }

    async fn fill(
        &self,
        block: &mut Block,
        session: &mut Option<Session>,
        cancel: &CancellationToken,
    ) -> Result<Fill, BlockError> {
        let offset = self.writer.metadata().block_offset(block.index()) + block.cursor() as u64;
        if session.as_ref().map(|s| s.position) != Some(offset) {
            *session = None;
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(Fill::Cancelled),
                opened = self.open_session(offset) => opened?,
            };
            *session = Some(opened);
        }
        let Some(s) = session.as_mut() else {
            return Err(BlockError::Unknown);
        };

        while block.remain() > 0 {
            if s.pending.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(Fill::Cancelled),
                    chunk = s.stream.next() => match chunk {
                        Some(Ok(bytes)) => s.pending = bytes,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(BlockError::ProtocolViolation(format!(
                                "stream ended at offset {}",
                                s.position
                            )))
                        }
                    },
                }
                continue;
            }

            let n = s.pending.len().min(block.remain()).min(self.read_size);
            let data = s.pending.split_to(n);
            if !self.assignment.write_if_assigned(block, &data)? {
                return Ok(Fill::Unassigned);
            }
            s.position += n as u64;
            self.stats.on_http_downloaded(n);
        }
        Ok(Fill::Complete)
    }

    async fn open_session(&self, offset: u64) -> Result<Session, BlockError> {
        tracing::debug!(source = self.id, offset, "opening ranged request");
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(BlockError::ProtocolViolation(format!(
                "expected 206 Partial Content, got {}",
                resp.status()
            )));
        }
        let expected = format!("bytes {offset}-");
        let echoed = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !echoed.starts_with(&expected) {
            return Err(BlockError::ProtocolViolation(format!(
                "content-range '{echoed}' does not start at {offset}"
            )));
        }
        Ok(Session {
            stream: resp.bytes_stream().boxed(),
            position: offset,
            pending: Bytes::new(),
        })
    }

    async fn finish(&self, block: Block) {
        let index = block.index();
        match close_block(block).await {
            Ok(ProgressStatus::Completed) => {
                self.assignment.finish(index);
                self.stats.on_http_block_downloaded();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::test_support::*;
    use crate::file_manager::FileManager;
    use crate::models::BlockProgress;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Origin answering `bytes=N-`. With `stall` set, the body is sent as the
    /// first 512 bytes, a pause of `stall`, then the rest.
    async fn serve(data: Vec<u8>, stall: Option<Duration>) -> (String, Arc<AtomicUsize>) {
        let data = Arc::new(data);
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let app = Router::new().route(
            "/file",
            get(move |headers: HeaderMap| {
                let data = data.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let start = headers
                        .get("range")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.strip_prefix("bytes="))
                        .and_then(|v| v.split('-').next())
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    let range = format!("bytes {}-{}/{}", start, data.len() - 1, data.len());
                    let mut head = Bytes::copy_from_slice(&data[start..]);
                    let body = match stall {
                        None => Body::from(head),
                        Some(pause) => {
                            let tail = head.split_off(head.len().min(512));
                            let first = futures_util::stream::once(async move { Ok::<_, Infallible>(head) });
                            let rest = futures_util::stream::once(async move {
                                tokio::time::sleep(pause).await;
                                Ok::<_, Infallible>(tail)
                            });
                            Body::from_stream(first.chain(rest))
                        }
                    };
                    (AxumStatus::PARTIAL_CONTENT, [("content-range", range)], body).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/file"), requests)
    }

    #[tokio::test]
    async fn downloads_assigned_blocks_in_ascending_order() {
        let data = pattern(4096, 7);
        let (url, requests) = serve(data.clone(), None).await;
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), "f", &url, &data, 1024);
        let file = FileManager::new(dir.path()).get_file("f").unwrap();
        let writer = Arc::new(file.try_open_writer().unwrap());
        let stats = Arc::new(DownloadStatistics::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let source = HttpSource::new(1, Client::new(), writer.clone(), stats.clone(), tx, &EngineConfig::default());
        source.assign_blocks(&BTreeSet::from([3, 0, 1]));
        assert!(!source.start());
        assert!(source.start());

        assert_eq!(rx.recv().await, Some(ComponentEvent::Started(1)));
        let mut order = Vec::new();
        while order.len() < 3 {
            match rx.recv().await.unwrap() {
                ComponentEvent::BlockCompleted { index, .. } => order.push(index),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(order, vec![0, 1, 3]);
        // 0 and 1 share a stream; the gap at 2 forces a fresh ranged request.
        assert_eq!(requests.load(Ordering::SeqCst), 2);
        assert!(!source.stop());
        assert_eq!(rx.recv().await, Some(ComponentEvent::Stopped(1)));
        assert!(source.stop());

        assert_eq!(writer.writable_blocks(), BTreeSet::from([2]));
        assert_eq!(stats.snapshot().http.bytes, 3072);
        assert_eq!(stats.snapshot().http.blocks, 3);
    }

    #[tokio::test]
    async fn corrupted_origin_reports_hash_mismatch() {
        let data = pattern(2048, 7);
        let mut served = data.clone();
        served[10] ^= 0xff;
        let (url, _) = serve(served, None).await;
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), "f", &url, &data, 1024);
        let file = FileManager::new(dir.path()).get_file("f").unwrap();
        let writer = Arc::new(file.try_open_writer().unwrap());
        let stats = Arc::new(DownloadStatistics::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let source = HttpSource::new(1, Client::new(), writer.clone(), stats, tx, &EngineConfig::default());
        source.assign_blocks(&BTreeSet::from([0, 1]));
        source.start();

        let mut failed = Vec::new();
        let mut completed = Vec::new();
        while failed.len() + completed.len() < 2 {
            match rx.recv().await.unwrap() {
                ComponentEvent::BlockFailed { index, error, .. } => failed.push((index, error)),
                ComponentEvent::BlockCompleted { index, .. } => completed.push(index),
                _ => {}
            }
        }
        assert_eq!(failed, vec![(0, BlockError::HashMismatch)]);
        assert_eq!(completed, vec![1]);
        source.stop();
        assert!(writer.status().completed_blocks.contains(&1));
        assert!(!writer.status().completed_blocks.contains(&0));
    }

    #[tokio::test]
    async fn block_unassigned_mid_stream_keeps_its_partial_progress() {
        let data = pattern(2048, 7);
        let (url, _) = serve(data.clone(), Some(Duration::from_millis(300))).await;
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), "f", &url, &data, 1024);
        let file = FileManager::new(dir.path()).get_file("f").unwrap();
        let writer = Arc::new(file.try_open_writer().unwrap());
        let stats = Arc::new(DownloadStatistics::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let source = HttpSource::new(1, Client::new(), writer.clone(), stats.clone(), tx, &EngineConfig::default());
        source.assign_blocks(&BTreeSet::from([0]));
        source.start();
        assert_eq!(rx.recv().await, Some(ComponentEvent::Started(1)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.snapshot().http.bytes == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        source.unassign_blocks(&BTreeSet::from([0]));

        tokio::time::timeout(Duration::from_secs(5), async {
            while writer.is_block_open(0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let written = stats.snapshot().http.bytes;
        assert!(written > 0 && written < 1024);
        assert_eq!(
            writer.status().progress_of(0),
            Some(BlockProgress {
                progress: written,
                status: ProgressStatus::Downloading,
            })
        );
        assert!(rx.try_recv().is_err());

        source.stop();
        assert_eq!(rx.recv().await, Some(ComponentEvent::Stopped(1)));
    }
}
