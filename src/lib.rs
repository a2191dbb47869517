pub mod config;
pub mod engine;
pub mod file_manager;
pub mod finder;
pub mod inspector;
pub mod integrity;
pub mod models;
pub mod progress_store;
pub mod rebalance;
pub mod resource;
pub mod service;
pub mod sharing;
pub mod source;
pub mod statistics;
pub mod transport;
pub mod writer;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{init_tracing, EngineConfig};
    pub use crate::engine::{DownloadEvent, DownloaderStatus, EngineError, MainDownloader};
    pub use crate::file_manager::{FileManager, MarkedFile, StoreError};
    pub use crate::inspector::BlockInspection;
    pub use crate::integrity::{create_meta_from_file, verify_file, DEFAULT_BLOCK_SIZE};
    pub use crate::models::{FileMetadata, ProgressRecord};
    pub use crate::service::ResService;
    pub use crate::statistics::FileStatistics;
    pub use crate::transport::{LoopbackNetwork, LoopbackTransport, PeerTransport};
    pub use crate::writer::{Block, MarkedFileWriter};
}
