mod common;

use blockshare::prelude::*;
use common::{asset, serve_bytes, until_stopped, write_asset};
use std::sync::Arc;

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn four_block_http_download_reports_each_block_once() {
    let data = asset(4 * MIB);
    let server = serve_bytes(data.clone()).await;
    let scratch = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let source = write_asset(scratch.path(), &data);
    create_meta_from_file(&source, "asset", data_dir.path(), &server.url, MIB as u64)
        .await
        .unwrap();

    let net = LoopbackNetwork::new();
    let transport: Arc<dyn PeerTransport> = Arc::new(net.transport("client", true));
    let svc = ResService::new(EngineConfig::default().with_data_dir(data_dir.path()), transport).unwrap();
    let mut events = svc.subscribe();

    svc.register("asset").await.unwrap();
    assert!(!svc.start_download("asset", true, false).await.unwrap());
    let seen = until_stopped(&mut events, "asset").await;

    let count = |f: fn(&DownloadEvent) -> bool| seen.iter().filter(|e| f(e)).count();
    assert_eq!(count(|e| matches!(e, DownloadEvent::Started { .. })), 1);
    assert_eq!(count(|e| matches!(e, DownloadEvent::BlockCompleted { .. })), 4);
    assert_eq!(count(|e| matches!(e, DownloadEvent::Completed { .. })), 1);
    assert_eq!(count(|e| matches!(e, DownloadEvent::BlockFailed { .. })), 0);
    assert!(matches!(seen.first(), Some(DownloadEvent::Started { .. })));
    assert!(matches!(seen.last(), Some(DownloadEvent::Stopped { .. })));
    // one ranged stream serves every contiguous block
    assert_eq!(server.requests(), 1);

    let file = FileManager::new(data_dir.path()).get_file("asset").unwrap();
    let record: ProgressRecord =
        serde_json::from_slice(&std::fs::read(file.companion_path("prog.json")).unwrap()).unwrap();
    assert!(record.completed);
    assert_eq!(record.completed_blocks.len(), 4);
    assert_eq!(std::fs::read(file.data_path()).unwrap(), data);
    assert!(verify_file(&file).await.unwrap());

    let stats = svc.get_statistics("asset").await.unwrap();
    assert_eq!(stats.download.http.bytes, data.len() as u64);
    assert_eq!(stats.download.http.blocks, 4);
    assert_eq!(stats.download.peer.bytes, 0);

    let inspection = svc.get_block_inspection("asset").await.unwrap();
    assert_eq!(inspection.len(), 4);
    assert!(inspection.values().all(|b| b.downloaded && b.url.as_deref() == Some(server.url.as_str())));

    assert_eq!(svc.status("asset").await.unwrap(), DownloaderStatus::Stopped);
    assert!(svc.start_download("asset", true, false).await.is_ok());
    let again = until_stopped(&mut events, "asset").await;
    assert_eq!(
        again,
        vec![
            DownloadEvent::Started { file: "asset".into() },
            DownloadEvent::Completed { file: "asset".into() },
            DownloadEvent::Stopped { file: "asset".into() },
        ]
    );
    assert_eq!(server.requests(), 1);

    svc.clear_resource("asset").await.unwrap();
    assert!(!file.data_path().exists());
    assert!(svc.get_block_inspection("asset").await.unwrap().is_empty());
    svc.shutdown().await;
}
