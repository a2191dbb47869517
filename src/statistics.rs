// src/statistics.rs

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Throughput over a sliding time window.
#[derive(Debug, Clone)]
pub struct SpeedMonitor {
    window: Duration,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl SpeedMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.samples.clear();
        self.window_bytes = 0;
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        self.evict(now);
    }

    /// Bytes per second over the window (or since reset, if shorter).
    pub fn speed(&mut self) -> f64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let span = now.saturating_duration_since(self.started).min(self.window);
        if span < Duration::from_millis(1) {
            return 0.0;
        }
        self.window_bytes as f64 / span.as_secs_f64()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.samples.front().copied() {
            if now.saturating_duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
    }
}

#[derive(Debug, Clone)]
struct Counter {
    bytes: u64,
    blocks: u64,
    speed: SpeedMonitor,
    last_speed: f64,
}

impl Counter {
    fn new(window: Duration) -> Self {
        Self {
            bytes: 0,
            blocks: 0,
            speed: SpeedMonitor::new(window),
            last_speed: 0.0,
        }
    }

    fn reset(&mut self) {
        self.bytes = 0;
        self.blocks = 0;
        self.speed.reset();
        self.last_speed = 0.0;
    }

    fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.speed.record(bytes);
    }

    fn refresh(&mut self) {
        self.last_speed = self.speed.speed();
    }

    fn snapshot(&self) -> TransferCounters {
        TransferCounters {
            bytes: self.bytes,
            blocks: self.blocks,
            speed: self.last_speed,
        }
    }
}

/// One row of a statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TransferCounters {
    pub bytes: u64,
    pub blocks: u64,
    /// Bytes per second, refreshed on every monitor tick.
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DownloadSnapshot {
    pub total: TransferCounters,
    pub http: TransferCounters,
    pub peer: TransferCounters,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UploadSnapshot {
    pub total: TransferCounters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FileStatistics {
    pub download: DownloadSnapshot,
    pub upload: UploadSnapshot,
}

struct DownloadInner {
    total: Counter,
    http: Counter,
    peer: Counter,
    started: Option<Instant>,
}

/// Download counters shared by the engine and its sources.
pub struct DownloadStatistics {
    inner: Mutex<DownloadInner>,
}

impl DownloadStatistics {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(DownloadInner {
                total: Counter::new(window),
                http: Counter::new(window),
                peer: Counter::new(window),
                started: None,
            }),
        }
    }

    /// Resets every counter; called when a download session starts.
    pub fn on_download_started(&self) {
        let mut inner = self.inner.lock();
        inner.total.reset();
        inner.http.reset();
        inner.peer.reset();
        inner.started = Some(Instant::now());
    }

    pub fn on_http_downloaded(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.total.add(bytes as u64);
        inner.http.add(bytes as u64);
    }

    pub fn on_peer_downloaded(&self, bytes: usize) {
        let mut inner = self.inner.lock();
        inner.total.add(bytes as u64);
        inner.peer.add(bytes as u64);
    }

    pub fn on_http_block_downloaded(&self) {
        let mut inner = self.inner.lock();
        inner.total.blocks += 1;
        inner.http.blocks += 1;
    }

    pub fn on_peer_block_downloaded(&self) {
        let mut inner = self.inner.lock();
        inner.total.blocks += 1;
        inner.peer.blocks += 1;
    }

    pub fn update_speed(&self) {
        let mut inner = self.inner.lock();
        inner.total.refresh();
        inner.http.refresh();
        inner.peer.refresh();
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let inner = self.inner.lock();
        DownloadSnapshot {
            total: inner.total.snapshot(),
            http: inner.http.snapshot(),
            peer: inner.peer.snapshot(),
            elapsed_ms: inner
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Upload counters for a shared file.
pub struct UploadStatistics {
    inner: Mutex<Counter>,
}

impl UploadStatistics {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(Counter::new(window)),
        }
    }

    /// Resets every counter; called when sharing (re-)begins.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn on_data_sent(&self, bytes: usize) {
        self.inner.lock().add(bytes as u64);
    }

    pub fn on_block_sent(&self) {
        self.inner.lock().blocks += 1;
    }

    pub fn update_speed(&self) {
        self.inner.lock().refresh();
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            total: self.inner.lock().snapshot(),
        }
    }
}
