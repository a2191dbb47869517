// src/main.rs

use anyhow::{bail, Result};
use blockshare::prelude::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "blockshare", version, about = "Multi-source resumable block downloader")]
struct Cli {
    /// Directory holding metadata, progress and data files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split a local file into blocks and write its metadata.
    Meta {
        file: PathBuf,
        #[arg(long)]
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = "")]
        url: String,
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,
    },
    /// Download a registered file until it completes or is interrupted.
    Download {
        id: String,
        #[arg(long)]
        no_http: bool,
        #[arg(long)]
        no_peers: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }
    init_tracing(&config);

    match cli.command {
        Command::Meta {
            file,
            id,
            out,
            url,
            block_size,
        } => {
            let out = out.unwrap_or_else(|| config.data_dir.clone());
            let path = create_meta_from_file(&file, &id, &out, &url, block_size).await?;
            println!("{}", path.display());
        }
        Command::Download { id, no_http, no_peers } => download(config, &id, !no_http, !no_peers).await?,
    }
    Ok(())
}

async fn download(config: EngineConfig, id: &str, http: bool, peers: bool) -> Result<()> {
    let files = FileManager::new(config.data_dir.clone());
    let network = LoopbackNetwork::new();
    let transport: Arc<dyn PeerTransport> = Arc::new(network.transport("local", true));
    let service = ResService::new(config, transport)?;
    let mut events = service.subscribe();

    service.register(id).await?;
    service.start_download(id, http, peers).await?;

    let mut completed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping");
                service.stop_download(id).await?;
            }
            event = events.recv() => match event {
                Ok(DownloadEvent::BlockCompleted { index, .. }) => {
                    let stats = service.get_statistics(id).await?;
                    println!("block {index} done, {} bytes total", stats.download.total.bytes);
                }
                Ok(DownloadEvent::BlockFailed { index, reason, .. }) => println!("block {index} failed: {reason}"),
                Ok(DownloadEvent::Completed { .. }) => {
                    completed = true;
                    println!("download complete");
                }
                Ok(DownloadEvent::Stopped { .. }) => break,
                Ok(DownloadEvent::Started { .. }) => println!("download started"),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event listener lagged"),
                Err(RecvError::Closed) => bail!("event stream closed"),
            }
        }
    }
    service.shutdown().await;
    if !completed {
        println!("download stopped before completion; run again to resume");
        return Ok(());
    }
    if !verify_file(&*files.get_file(id)?).await? {
        bail!("{id}: data does not match the metadata hash");
    }
    println!("file hash verified");
    Ok(())
}
