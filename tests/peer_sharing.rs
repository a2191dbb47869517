mod common;

use blockshare::prelude::*;
use common::{asset, serve_bytes, until_stopped, write_asset};
use std::sync::Arc;
use std::time::Duration;

const BLOCK: u64 = 256 * 1024;

fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        discovery_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_secs(5),
        ..EngineConfig::default().with_data_dir(dir)
    }
}

#[tokio::test]
async fn second_node_downloads_everything_from_a_sharing_peer() {
    let data = asset(6 * BLOCK as usize + 1234);
    let server = serve_bytes(data.clone()).await;
    let scratch = tempfile::tempdir().unwrap();
    let seeder_dir = tempfile::tempdir().unwrap();
    let leecher_dir = tempfile::tempdir().unwrap();
    let source = write_asset(scratch.path(), &data);
    create_meta_from_file(&source, "asset", seeder_dir.path(), &server.url, BLOCK)
        .await
        .unwrap();
    // The leecher cannot reach any origin; peers are its only way in.
    create_meta_from_file(&source, "asset", leecher_dir.path(), "http://127.0.0.1:9/none", BLOCK)
        .await
        .unwrap();

    let net = LoopbackNetwork::new();
    let seeder_transport: Arc<dyn PeerTransport> = Arc::new(net.transport("seeder", true));
    let leecher_transport: Arc<dyn PeerTransport> = Arc::new(net.transport("leecher", false));
    let seeder = ResService::new(config(seeder_dir.path()), seeder_transport).unwrap();
    let leecher = ResService::new(config(leecher_dir.path()), leecher_transport).unwrap();

    let mut seeder_events = seeder.subscribe();
    seeder.register("asset").await.unwrap();
    seeder.start_download("asset", true, false).await.unwrap();
    until_stopped(&mut seeder_events, "asset").await;
    assert!(!seeder.set_sharing("asset", true).await.unwrap());
    assert!(seeder.set_sharing("asset", true).await.unwrap());

    let mut leecher_events = leecher.subscribe();
    leecher.register("asset").await.unwrap();
    leecher.start_download("asset", false, true).await.unwrap();
    let seen = until_stopped(&mut leecher_events, "asset").await;

    let completed = seen
        .iter()
        .filter(|e| matches!(e, DownloadEvent::BlockCompleted { .. }))
        .count();
    assert_eq!(completed, 7);
    assert!(seen.contains(&DownloadEvent::Completed { file: "asset".into() }));

    let file = FileManager::new(leecher_dir.path()).get_file("asset").unwrap();
    assert!(file.is_complete());
    assert_eq!(std::fs::read(file.data_path()).unwrap(), data);

    let down = leecher.get_statistics("asset").await.unwrap().download;
    assert_eq!(down.peer.bytes, data.len() as u64);
    assert_eq!(down.http.bytes, 0);
    let up = seeder.get_statistics("asset").await.unwrap().upload;
    assert_eq!(up.total.bytes, data.len() as u64);
    assert_eq!(up.total.blocks, 7);

    let inspection = leecher.get_block_inspection("asset").await.unwrap();
    assert!(inspection
        .values()
        .all(|b| b.url.as_deref().is_some_and(|u| u.starts_with("loopback+tcp://seeder"))));

    assert!(!seeder.set_sharing("asset", false).await.unwrap());
    assert!(matches!(
        seeder.clear_resource("asset").await,
        Ok(())
    ));
    leecher.shutdown().await;
    seeder.shutdown().await;
}
