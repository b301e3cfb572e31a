//! End-to-end tests: worker streams, heartbeats and the master's view.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use worker_cache::cache::block::SessionId;
use worker_cache::config::Config;
use worker_cache::master::registry::MasterRegistry;
use worker_cache::server::status_api::{build_router, AppState, UsageResponse};
use worker_cache::storage::local::LocalUnderStorage;
use worker_cache::worker::{ClientOptions, Worker, WriteOutcome};

const WORKER_ID: u64 = 1;

async fn test_worker(capacity: u64) -> (Arc<Worker>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.worker.worker_id = WORKER_ID;
    config.worker.capacity_bytes = capacity;
    config.heartbeat.interval_ms = 100;
    config.under_storage.path = tmp.path().to_path_buf();

    let ufs = LocalUnderStorage::new(config.under_storage.path.clone())
        .await
        .unwrap();
    let worker = Worker::new(Arc::new(config), Arc::new(ufs)).unwrap();
    (Arc::new(worker), tmp)
}

async fn write_block(worker: &Worker, block_id: u64, len: usize, options: ClientOptions) -> WriteOutcome {
    let mut out = worker
        .create_block(block_id, SessionId::new(), options)
        .await
        .unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    out.write(&data);
    out.close().await.unwrap()
}

#[tokio::test]
async fn test_read_seek_read_round_trip() {
    let (worker, _tmp) = test_worker(20_000).await;
    let outcome = write_block(&worker, 1, 4000, ClientOptions::write_both()).await;
    assert!(matches!(outcome, WriteOutcome::Cached { persisted: true, .. }));

    let session = SessionId::new();
    let mut input = worker
        .open_block(1, session, ClientOptions::default())
        .await
        .unwrap();
    assert!(input.is_cached());
    assert_eq!(input.size(), 4000);

    let mut first = vec![0u8; 4000];
    assert_eq!(input.read(&mut first).unwrap(), 4000);
    assert_eq!(input.read(&mut [0u8; 8]).unwrap(), 0);
    let after_first = worker.store().describe(1).unwrap().last_access;

    input.seek(0).unwrap();
    let mut second = vec![0u8; 4000];
    assert_eq!(input.read(&mut second).unwrap(), 4000);
    let after_second = worker.store().describe(1).unwrap().last_access;

    assert_eq!(first, second);
    assert!(after_second > after_first);
    assert!(input.seek(4001).is_err());

    input.close();
    assert!(!worker.store().is_locked(1));
}

#[tokio::test]
async fn test_open_stream_pins_block() {
    let (worker, _tmp) = test_worker(20_000).await;
    for id in 0..5 {
        write_block(&worker, id, 4000, ClientOptions::default()).await;
    }

    let input = worker
        .open_block(0, SessionId::new(), ClientOptions::default())
        .await
        .unwrap();

    let outcome = write_block(&worker, 5, 4000, ClientOptions::default()).await;
    assert_eq!(
        outcome,
        WriteOutcome::Cached {
            persisted: false,
            evicted: vec![1],
        }
    );

    // Opening does not count as an access; once unpinned, block 0 is oldest again.
    drop(input);
    let outcome = write_block(&worker, 6, 4000, ClientOptions::default()).await;
    assert_eq!(
        outcome,
        WriteOutcome::Cached {
            persisted: false,
            evicted: vec![0],
        }
    );
}

#[tokio::test]
async fn test_heartbeat_updates_master_view() {
    let (worker, _tmp) = test_worker(20_000).await;
    let registry = Arc::new(MasterRegistry::new());
    let heartbeat = worker.heartbeat_synchronizer(registry.clone());

    for id in 0..5u64 {
        write_block(&worker, id, 4000, ClientOptions::default()).await;
        registry.register_file(id, vec![(id, 4000)]);
    }
    let report = heartbeat.tick().await;
    assert!(report.delivered);
    assert_eq!(report.added, 5);
    assert_eq!(registry.worker_blocks(WORKER_ID), vec![0, 1, 2, 3, 4]);
    for file in 0..5 {
        assert_eq!(registry.cache_percentage(file), Some(100));
    }

    write_block(&worker, 5, 4000, ClientOptions::default()).await;
    registry.register_file(5, vec![(5, 4000)]);
    let report = heartbeat.tick().await;
    assert_eq!((report.added, report.removed), (1, 1));

    assert_eq!(registry.cache_percentage(0), Some(0));
    assert_eq!(registry.cache_percentage(5), Some(100));
    assert!(registry.block_locations(0).is_empty());
    assert_eq!(registry.block_locations(5), vec![WORKER_ID]);

    let entry = registry.worker(WORKER_ID).unwrap();
    assert_eq!(entry.used_bytes, 20_000);
    assert_eq!(entry.capacity_bytes, 20_000);
}

#[tokio::test]
async fn test_master_delete_applied_on_heartbeat() {
    let (worker, _tmp) = test_worker(20_000).await;
    let registry = Arc::new(MasterRegistry::new());
    let heartbeat = worker.heartbeat_synchronizer(registry.clone());

    write_block(&worker, 1, 1000, ClientOptions::default()).await;
    write_block(&worker, 2, 1000, ClientOptions::default()).await;
    heartbeat.tick().await;

    let input = worker
        .open_block(2, SessionId::new(), ClientOptions::default())
        .await
        .unwrap();
    registry.schedule_delete(WORKER_ID, 1);
    registry.schedule_delete(WORKER_ID, 2);

    let report = heartbeat.tick().await;
    assert_eq!(report.deleted, vec![1]);
    assert!(!worker.store().is_resident(1));
    assert!(worker.store().is_resident(2));
    drop(input);

    // The removal of 1 reaches the master; the leased delete is retried.
    let report = heartbeat.tick().await;
    assert_eq!(report.deleted, vec![2]);
    assert_eq!(registry.worker_blocks(WORKER_ID), vec![2]);

    heartbeat.tick().await;
    assert!(registry.worker_blocks(WORKER_ID).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_master_view_converges_within_two_intervals() {
    let (worker, _tmp) = test_worker(20_000).await;
    let registry = Arc::new(MasterRegistry::new());
    let shutdown = CancellationToken::new();
    let handle = worker
        .heartbeat_synchronizer(registry.clone())
        .spawn(shutdown.clone());

    let interval = worker.config().heartbeat_interval();
    tokio::time::sleep(interval / 3).await;

    let session = SessionId::new();
    for id in 0..5u64 {
        worker
            .store()
            .admit(id, bytes::Bytes::from(vec![0u8; 4000]), session)
            .unwrap();
    }
    // Not visible until a heartbeat carries it.
    assert!(registry.worker_blocks(WORKER_ID).is_empty());

    tokio::time::sleep(worker.config().staleness_bound() + Duration::from_millis(10)).await;
    assert_eq!(registry.worker_blocks(WORKER_ID), vec![0, 1, 2, 3, 4]);
    assert_eq!(registry.worker(WORKER_ID).unwrap().used_bytes, 20_000);

    // Quiet workers still heartbeat.
    let seen = registry.last_heartbeat(WORKER_ID).unwrap();
    tokio::time::sleep(interval * 2).await;
    assert!(registry.last_heartbeat(WORKER_ID).unwrap() > seen);
    assert!(registry.lost_workers(interval * 3).is_empty());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_under_storage_fallback_when_cache_full() {
    let (worker, _tmp) = test_worker(8000).await;
    write_block(&worker, 1, 4000, ClientOptions::default()).await;
    write_block(&worker, 2, 4000, ClientOptions::default()).await;

    let _pin1 = worker
        .open_block(1, SessionId::new(), ClientOptions::default())
        .await
        .unwrap();
    let _pin2 = worker
        .open_block(2, SessionId::new(), ClientOptions::default())
        .await
        .unwrap();

    let outcome = write_block(&worker, 3, 4000, ClientOptions::write_both()).await;
    assert_eq!(outcome, WriteOutcome::UnderStorageOnly { bytes_short: Some(4000) });

    // The persisted copy is still readable.
    let mut input = worker
        .open_block(3, SessionId::new(), ClientOptions::default())
        .await
        .unwrap();
    assert!(!input.is_cached());
    let mut buf = vec![0u8; 4000];
    assert_eq!(input.read(&mut buf).unwrap(), 4000);
}

#[tokio::test]
async fn test_status_api_reports_usage() {
    let (worker, _tmp) = test_worker(20_000).await;
    write_block(&worker, 1, 4000, ClientOptions::default()).await;

    let state = Arc::new(AppState {
        worker: worker.clone(),
        registry: None,
        start_time: std::time::Instant::now(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    let client = reqwest::Client::new();
    let usage: UsageResponse = client
        .get(format!("http://{addr}/v1/cache/usage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage.used_bytes, 4000);
    assert_eq!(usage.free_bytes, 16_000);
    assert_eq!(usage.resident_blocks, 1);

    let missing = client
        .get(format!("http://{addr}/v1/blocks/99"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let metrics = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("worker_cache_admitted_blocks_total"));
}
