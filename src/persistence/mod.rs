//! Hybrid persistence: append-only log + point-in-time snapshots.
//!
//! Boot order matters: the RDB snapshot is restored first, then the AOF is
//! replayed over it. The AOF records every effect since (at least) the
//! snapshot's logical cut, and re-applying an upsert log is idempotent, so
//! the combination reconstructs the exact pre-crash state.
//!
//! Write requests go log-first: a record is appended (and, in sync mode,
//! fsynced) before the in-memory index accepts the update.

pub mod aof;
pub mod record;
pub mod snapshot;

use crate::index::Index;
use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use aof::{Aof, AofConfig};

/// Index shared between the HTTP handlers, the snapshot timer, and the
/// persistence controller within one worker.
pub type SharedIndex = Arc<RwLock<Index>>;

/// Error type for the persistence engines.
#[derive(Debug)]
pub enum PersistError {
    /// I/O error
    Io(IoError),
    /// CRC mismatch, short read, or truncated record. Fatal at startup.
    Corruption(String),
    /// No space left on the device backing the log.
    DiskFull,
    /// A single-record write came up short.
    PartialWrite { expected: usize, actual: usize },
    /// The batched writer task is gone.
    WriterClosed,
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "persistence I/O error: {}", e),
            PersistError::Corruption(msg) => write!(f, "persistence corruption: {}", msg),
            PersistError::DiskFull => write!(f, "disk full"),
            PersistError::PartialWrite { expected, actual } => {
                write!(f, "partial write: expected {} bytes, wrote {}", expected, actual)
            }
            PersistError::WriterClosed => write!(f, "AOF writer unavailable"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<IoError> for PersistError {
    fn from(e: IoError) -> Self {
        if e.raw_os_error() == Some(libc::ENOSPC) || e.kind() == ErrorKind::WriteZero {
            PersistError::DiskFull
        } else {
            PersistError::Io(e)
        }
    }
}

impl PersistError {
    /// Recovery errors abort startup; only corruption maps to the
    /// "refuse to start" exit code.
    pub fn is_corruption(&self) -> bool {
        matches!(self, PersistError::Corruption(_))
    }
}

/// Everything the controller needs to boot both engines.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub rdb_path: PathBuf,
    pub aof_path: PathBuf,
    pub snapshot_interval: Duration,
    /// Zero selects sync mode; positive selects batched mode.
    pub aof_flush_interval: Duration,
    pub ring_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            rdb_path: PathBuf::from("./dump.rdb"),
            aof_path: PathBuf::from("./append.aof"),
            snapshot_interval: Duration::from_secs(60),
            aof_flush_interval: Duration::from_millis(10),
            ring_capacity: 1 << 16,
        }
    }
}

/// Owns the AOF engine and the periodic snapshot timer for one worker.
#[derive(Debug)]
pub struct Persistence {
    aof: Aof,
    rdb_path: PathBuf,
    index: SharedIndex,
    snapshot_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    compacting: AtomicBool,
}

impl Persistence {
    /// Restore state (RDB then AOF replay), open the log for appending, and
    /// arm the snapshot timer. Corruption in either load is returned as-is;
    /// the worker bootstrap turns it into exit code 2.
    pub async fn init(cfg: PersistenceConfig, index: SharedIndex) -> Result<Self, PersistError> {
        {
            let mut idx = index.write().await;

            let restored = snapshot::load(&cfg.rdb_path, &mut idx)?;
            if restored > 0 {
                info!(records = restored, path = %cfg.rdb_path.display(), "RDB restored");
            }

            let replayed = Aof::load(&cfg.aof_path, &mut idx)?;
            if replayed > 0 {
                info!(records = replayed, path = %cfg.aof_path.display(), "AOF replayed");
            }
        }

        let aof = Aof::open(AofConfig {
            path: cfg.aof_path.clone(),
            ring_capacity: cfg.ring_capacity,
            flush_interval: cfg.aof_flush_interval,
        })?;

        let persistence = Persistence {
            aof,
            rdb_path: cfg.rdb_path.clone(),
            index: index.clone(),
            snapshot_task: parking_lot::Mutex::new(None),
            compacting: AtomicBool::new(false),
        };
        persistence.arm_snapshot_timer(cfg.snapshot_interval);
        Ok(persistence)
    }

    fn arm_snapshot_timer(&self, interval: Duration) {
        let index = self.index.clone();
        let rdb_path = self.rdb_path.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = snapshot::dump_index(&rdb_path, &index).await {
                    error!(error = %e, "periodic snapshot failed");
                }
            }
        });
        *self.snapshot_task.lock() = Some(task);
    }

    /// Append one record to the log. In sync mode this returns only after
    /// write + fsync; in batched mode it returns once the record is in the
    /// ring (backpressure applies when the ring is full).
    pub async fn append(&self, key: i32, value: &[u8]) -> Result<(), PersistError> {
        self.aof.append(key, value).await
    }

    /// Compact both files: a synchronous RDB rewrite from a frozen view of
    /// the index, then an AOF rewrite from the same view. Only one
    /// compaction runs at a time; overlapping requests are dropped.
    ///
    /// Callers must not hold the index lock.
    pub async fn compact(&self) -> Result<(), PersistError> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("compaction already in progress");
            return Ok(());
        }

        let result = self.compact_inner().await;
        self.compacting.store(false, Ordering::Release);
        if let Err(ref e) = result {
            error!(error = %e, "compaction failed");
        }
        result
    }

    async fn compact_inner(&self) -> Result<(), PersistError> {
        // Capture the frozen view and enqueue the AOF rewrite under the same
        // write-lock hold. Any append already in the ring has its index
        // effect in this view; any later append lands on the new file.
        let (entries, ack) = {
            let idx = self.index.write().await;
            let entries = idx.entries();
            let ack = self.aof.rewrite(entries.clone()).await?;
            (entries, ack)
        };

        info!(records = entries.len(), "compaction started");
        snapshot::dump(&self.rdb_path, entries).await?;
        ack.wait().await?;
        info!("compaction complete");
        Ok(())
    }

    /// Stop the snapshot timer and shut the AOF down cleanly (drain, fsync,
    /// close).
    pub async fn shutdown(&self) {
        if let Some(task) = self.snapshot_task.lock().take() {
            task.abort();
        }
        self.aof.shutdown().await;
        info!("persistence shut down");
    }
}
