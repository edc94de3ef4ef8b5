//! Concurrent appenders sharing one log file. Each record is framed into a
//! single `write(2)` on an `O_APPEND` descriptor, so records from separate
//! engines (standing in for separate worker processes) must never
//! interleave: after all writers stop, every record replays CRC-valid.

use ramforge::persistence::aof::{Aof, AofConfig};
use ramforge::Index;
use std::time::Duration;
use tempfile::TempDir;

fn engine_config(dir: &TempDir, flush: Duration) -> AofConfig {
    AofConfig {
        path: dir.path().join("append.aof"),
        ring_capacity: 1024,
        flush_interval: flush,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_batched_writers_disjoint_keys() {
    let dir = TempDir::new().unwrap();
    const WRITERS: i32 = 4;
    const PER_WRITER: i32 = 1000;

    let mut tasks = Vec::new();
    for w in 0..WRITERS {
        let cfg = engine_config(&dir, Duration::from_millis(2));
        tasks.push(tokio::spawn(async move {
            let aof = Aof::open(cfg).unwrap();
            for i in 0..PER_WRITER {
                let key = w * PER_WRITER + i;
                aof.append(key, format!("writer-{}-record-{}", w, i).as_bytes())
                    .await
                    .unwrap();
            }
            aof.shutdown().await;
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let mut index = Index::new();
    let replayed = Aof::load(&dir.path().join("append.aof"), &mut index).unwrap();
    assert_eq!(replayed, (WRITERS * PER_WRITER) as usize);
    assert_eq!(index.len(), (WRITERS * PER_WRITER) as usize);

    for w in 0..WRITERS {
        for i in (0..PER_WRITER).step_by(97) {
            let key = w * PER_WRITER + i;
            assert_eq!(
                index.get(key),
                Some(format!("writer-{}-record-{}", w, i).as_bytes())
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_and_batched_writers_can_share_the_log() {
    let dir = TempDir::new().unwrap();

    let sync_cfg = engine_config(&dir, Duration::ZERO);
    let batched_cfg = engine_config(&dir, Duration::from_millis(2));

    let sync_task = tokio::spawn(async move {
        let aof = Aof::open(sync_cfg).unwrap();
        for i in 0..200 {
            aof.append(i, b"sync").await.unwrap();
        }
        aof.shutdown().await;
    });
    let batched_task = tokio::spawn(async move {
        let aof = Aof::open(batched_cfg).unwrap();
        for i in 1000..1200 {
            aof.append(i, b"batched").await.unwrap();
        }
        aof.shutdown().await;
    });
    sync_task.await.unwrap();
    batched_task.await.unwrap();

    let mut index = Index::new();
    let replayed = Aof::load(&dir.path().join("append.aof"), &mut index).unwrap();
    assert_eq!(replayed, 400);
    assert_eq!(index.get(5), Some(&b"sync"[..]));
    assert_eq!(index.get(1005), Some(&b"batched"[..]));
}
