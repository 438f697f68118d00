//! End-to-end pipeline tests: concurrent producers, the publisher, and
//! range queries through the server API, over both store implementations.

use cistern::codec::ProducerId;
use cistern::collector::CollectError;
use cistern::config::ServerConfig;
use cistern::server::{Server, ServerError, ServerState};
use cistern::sink::{FileSink, MemorySink};
use cistern::store::{InMemoryStore, Namespaces, SimulatedStore, SimulatedStoreConfig, Store};
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_deliveries(sink: &MemorySink, count: usize) {
    for _ in 0..400 {
        if sink.commit_timestamps().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_publish_in_commit_order() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();
    let server = Server::open(ServerConfig::test(dir.path()), sink.clone()).unwrap();
    server.start().unwrap();

    // Producer p owns every commit ts congruent to p mod 4
    let mut handles = Vec::new();
    for p in 0..4i64 {
        handles.push(server.connect_producer(ProducerId::new(format!("node-{}", p))).unwrap());
    }
    let mut tasks = Vec::new();
    for (p, handle) in handles.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            for ts in (1..=100i64).filter(|ts| ts % 4 == p as i64) {
                handle.deliver(ts, ts.to_string().into_bytes()).await?;
            }
            // Nothing more to send; release the window
            handle.heartbeat(1_000).await?;
            handle.disconnect();
            Ok::<_, CollectError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(server.window_bounds().lower, 1_000);
    wait_for_deliveries(&sink, 100).await;
    assert_eq!(sink.commit_timestamps(), (1..=100).collect::<Vec<_>>());

    let result = server.range_query(50, 5).unwrap();
    assert!(result.is_ok());
    let payloads: Vec<String> = result
        .payloads
        .iter()
        .map(|p| String::from_utf8(p.to_vec()).unwrap())
        .collect();
    assert_eq!(payloads, vec!["51", "52", "53", "54", "55"]);
    assert_eq!(result.end_commit_ts, 55);

    let report = server.close().await.unwrap();
    assert_eq!(report.publisher.unwrap().unwrap().save_point, 100);
    assert!(report.producers.iter().all(|r| r.is_ok()));
}

#[tokio::test]
async fn test_stalled_producer_blocks_until_excluded() {
    let sink = MemorySink::new();
    let config = ServerConfig::test("/unused");
    let ns = Namespaces::for_cluster(config.cluster_id);
    let store = Arc::new(InMemoryStore::new(&ns.all()));
    let server = Server::with_store(store, config, sink.clone()).unwrap();
    server.start().unwrap();

    let fast = server.connect_producer(ProducerId::new("fast")).unwrap();
    let stalled = server.connect_producer(ProducerId::new("stalled")).unwrap();
    for ts in 1..=10 {
        fast.deliver(ts, &b"x"[..]).await.unwrap();
    }
    stalled.disconnect();

    // The silent producer still holds lower at its registration point
    assert_eq!(server.window_bounds().lower, 0);
    assert!(server.range_query(0, 100).unwrap().payloads.is_empty());

    let bounds = server.exclude_producer(&ProducerId::new("stalled")).unwrap();
    assert_eq!(bounds.lower, 10);
    wait_for_deliveries(&sink, 9).await;
    assert_eq!(sink.commit_timestamps(), (1..=9).collect::<Vec<_>>());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_window_failure_does_not_expose_entry() {
    let config = ServerConfig::test("/unused");
    let ns = Namespaces::for_cluster(config.cluster_id);
    let store = Arc::new(SimulatedStore::new(
        InMemoryStore::new(&ns.all()),
        9,
        SimulatedStoreConfig::no_faults(),
    ));
    let sink = MemorySink::new();
    let server = Server::with_store(store.clone(), config.clone(), sink.clone()).unwrap();
    server.start().unwrap();

    let a = server.connect_producer(ProducerId::new("a")).unwrap();
    a.deliver(1, &b"one"[..]).await.unwrap();
    a.deliver(2, &b"two"[..]).await.unwrap();
    assert_eq!(server.window_bounds().lower, 2);

    // Entry write succeeds, the window persist behind it fails
    let entries_before = store.inner().len(&ns.entries);
    store.fail_writes_after(1, 1);
    let err = a.deliver(3, &b"three"[..]).await.unwrap_err();
    assert!(matches!(err, CollectError::Window { commit_ts: 3, .. }));
    assert_eq!(store.inner().len(&ns.entries), entries_before + 1);
    assert_eq!(server.window_bounds().lower, 2);
    assert_eq!(server.range_query(0, 10).unwrap().payloads.len(), 1);

    let report = server.close().await.unwrap();
    assert!(report.producers.iter().any(|r| r.is_err()));

    // Restart: lower is where it was and nothing at or above it was published
    store.inner().simulate_crash();
    let sink2 = MemorySink::new();
    let server = Server::with_store(store, config, sink2.clone()).unwrap();
    assert_eq!(server.window_bounds().lower, 2);
    server.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut seen = sink.commit_timestamps();
    seen.extend(sink2.commit_timestamps());
    assert!(seen.iter().all(|&ts| ts < 2));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_file_sink_output_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("published.log");
    let config = ServerConfig::test(dir.path().join("data"));

    for round in 0..2i64 {
        let base = round * 20;
        let sink = FileSink::open(&out, true).await.unwrap();
        let server = Server::open(config.clone(), sink).unwrap();
        server.start().unwrap();
        let p = server.connect_producer(ProducerId::new("p")).unwrap();
        for ts in base + 1..=base + 10 {
            p.deliver(ts, ts.to_string().into_bytes()).await.unwrap();
        }
        p.heartbeat(base + 11).await.unwrap();

        for _ in 0..400 {
            if FileSink::read_all(&out).unwrap().len() as i64 >= (round + 1) * 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.close().await.unwrap();
    }

    let published: Vec<i64> = FileSink::read_all(&out)
        .unwrap()
        .iter()
        .map(|e| e.commit_ts)
        .collect();
    assert_eq!(published, (1..=10).chain(21..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_closed_server_rejects_everything() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(ServerConfig::test(dir.path()), MemorySink::new()).unwrap();
    server.start().unwrap();
    server.close().await.unwrap();

    assert_eq!(server.state(), ServerState::Closed);
    assert!(matches!(
        server.connect_producer(ProducerId::new("late")),
        Err(ServerError::InvalidState { .. })
    ));
    assert!(matches!(server.start(), Err(ServerError::InvalidState { .. })));
}

#[tokio::test]
async fn test_store_is_reopened_from_disk_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::test(dir.path());
    {
        let server = Server::open(config.clone(), MemorySink::new()).unwrap();
        server.start().unwrap();
        let p = server.connect_producer(ProducerId::new("p")).unwrap();
        p.deliver(7, &b"seven"[..]).await.unwrap();
        server.close().await.unwrap();
    }

    let store = cistern::store::FileStore::open(
        dir.path(),
        &Namespaces::for_cluster(config.cluster_id).all(),
        false,
    )
    .unwrap();
    let ns = Namespaces::for_cluster(config.cluster_id);
    assert!(store
        .get(&ns.entries, &cistern::codec::encode_commit_ts(7))
        .unwrap()
        .is_some());
}
