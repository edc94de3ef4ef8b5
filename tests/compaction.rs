//! Compaction: the rewritten log must contain exactly one CRC-valid record
//! per live key, and a cold restart from the compacted files must
//! reproduce the pre-compaction live state.

use ramforge::persistence::record::RecordReader;
use ramforge::{Index, Persistence, PersistenceConfig, SharedIndex};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;

fn config(dir: &TempDir, flush: Duration) -> PersistenceConfig {
    PersistenceConfig {
        rdb_path: dir.path().join("dump.rdb"),
        aof_path: dir.path().join("append.aof"),
        snapshot_interval: Duration::from_secs(3600),
        aof_flush_interval: flush,
        ring_capacity: 4096,
    }
}

fn shared() -> SharedIndex {
    Arc::new(RwLock::new(Index::new()))
}

/// Read every record in an AOF, verifying each footer along the way.
fn count_records(path: &Path) -> usize {
    let mut reader = RecordReader::new(BufReader::new(File::open(path).unwrap()));
    let mut count = 0;
    while reader.next_record().unwrap().is_some() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn thousand_overwrites_compact_to_a_thousand_records() {
    let dir = TempDir::new().unwrap();
    let index = shared();
    let persistence = Persistence::init(config(&dir, Duration::from_millis(5)), index.clone())
        .await
        .unwrap();

    // Insert 1000 records, then overwrite each once: 2000 log records.
    for pass in 0..2 {
        for k in 0..1000 {
            let value = format!("pass-{}-key-{}", pass, k);
            let mut idx = index.write().await;
            persistence.append(k, value.as_bytes()).await.unwrap();
            idx.save(k, value.as_bytes());
        }
    }
    persistence.compact().await.unwrap();
    persistence.shutdown().await;

    assert_eq!(count_records(&dir.path().join("append.aof")), 1000);
}

#[tokio::test]
async fn rewrite_equivalence_across_restart() {
    let dir = TempDir::new().unwrap();
    let index = shared();
    let persistence = Persistence::init(config(&dir, Duration::from_millis(5)), index.clone())
        .await
        .unwrap();

    for k in 0..300 {
        for version in 0..3 {
            let value = format!("k{}v{}", k, version);
            let mut idx = index.write().await;
            persistence.append(k, value.as_bytes()).await.unwrap();
            idx.save(k, value.as_bytes());
        }
    }
    let before: HashMap<i32, Vec<u8>> = index
        .read()
        .await
        .iter()
        .map(|(k, v)| (k, v.to_vec()))
        .collect();

    persistence.compact().await.unwrap();
    persistence.shutdown().await;

    let restarted = shared();
    let persistence = Persistence::init(config(&dir, Duration::from_millis(5)), restarted.clone())
        .await
        .unwrap();
    let after: HashMap<i32, Vec<u8>> = restarted
        .read()
        .await
        .iter()
        .map(|(k, v)| (k, v.to_vec()))
        .collect();
    persistence.shutdown().await;

    assert_eq!(before, after);
    assert_eq!(after.get(&7).map(Vec::as_slice), Some(&b"k7v2"[..]));
}

#[tokio::test]
async fn sync_mode_compaction_counts_match() {
    let dir = TempDir::new().unwrap();
    let index = shared();
    let persistence = Persistence::init(config(&dir, Duration::ZERO), index.clone())
        .await
        .unwrap();

    for pass in 0..2 {
        for k in 0..100 {
            let value = format!("p{}k{}", pass, k);
            let mut idx = index.write().await;
            persistence.append(k, value.as_bytes()).await.unwrap();
            idx.save(k, value.as_bytes());
        }
    }
    persistence.compact().await.unwrap();
    persistence.shutdown().await;

    assert_eq!(count_records(&dir.path().join("append.aof")), 100);
}

#[tokio::test]
async fn writes_during_compaction_survive() {
    let dir = TempDir::new().unwrap();
    let index = shared();
    let persistence = Arc::new(
        Persistence::init(config(&dir, Duration::from_millis(2)), index.clone())
            .await
            .unwrap(),
    );

    for k in 0..200 {
        let mut idx = index.write().await;
        persistence.append(k, b"before").await.unwrap();
        idx.save(k, b"before");
    }

    // Compact concurrently with a second wave of writes.
    let compactor = {
        let p = persistence.clone();
        tokio::spawn(async move { p.compact().await })
    };
    for k in 200..400 {
        let mut idx = index.write().await;
        persistence.append(k, b"during").await.unwrap();
        idx.save(k, b"during");
    }
    compactor.await.unwrap().unwrap();
    persistence.shutdown().await;

    let restarted = shared();
    let persistence = Persistence::init(config(&dir, Duration::from_millis(2)), restarted.clone())
        .await
        .unwrap();
    let after = restarted.read().await.len();
    persistence.shutdown().await;

    assert_eq!(after, 400, "no write may be lost across the compaction cut");
}
