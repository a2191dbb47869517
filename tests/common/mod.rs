#![allow(dead_code)]

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use blockshare::engine::DownloadEvent;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Minimal origin honoring `Range: bytes=a-` and `bytes=a-b`.
pub struct RangeServer {
    pub url: String,
    requests: Arc<AtomicUsize>,
}

impl RangeServer {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let spec = headers.get("range")?.to_str().ok()?.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() { len - 1 } else { end.parse().ok()? };
    (start <= end && end < len).then_some((start, end))
}

pub async fn serve_bytes(data: Vec<u8>) -> RangeServer {
    let data = Arc::new(data);
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    let app = Router::new().route(
        "/asset.bin",
        get(move |headers: HeaderMap| {
            let data = data.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let response: Response = match parse_range(&headers, data.len()) {
                    Some((start, end)) => (
                        StatusCode::PARTIAL_CONTENT,
                        [("content-range", format!("bytes {start}-{end}/{}", data.len()))],
                        data[start..=end].to_vec(),
                    )
                        .into_response(),
                    None => (StatusCode::OK, data.to_vec()).into_response(),
                };
                response
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    RangeServer {
        url: format!("http://{addr}/asset.bin"),
        requests,
    }
}

pub fn asset(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn write_asset(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("asset.bin");
    std::fs::write(&path, data).unwrap();
    path
}

/// Collects events for `file` up to and including its `Stopped`.
pub async fn until_stopped(rx: &mut broadcast::Receiver<DownloadEvent>, file: &str) -> Vec<DownloadEvent> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = rx.recv().await.unwrap();
            let mine = match &event {
                DownloadEvent::Started { file: f }
                | DownloadEvent::BlockCompleted { file: f, .. }
                | DownloadEvent::BlockFailed { file: f, .. }
                | DownloadEvent::Completed { file: f }
                | DownloadEvent::Stopped { file: f } => f == file,
            };
            if !mine {
                continue;
            }
            let done = matches!(event, DownloadEvent::Stopped { .. });
            out.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("download did not stop in time");
    out
}
