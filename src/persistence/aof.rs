//! Append-only log engine.
//!
//! Two durability policies share one wire format:
//!
//! - **Sync** (`flush_interval == 0`): `append` writes the frame and fsyncs
//!   before returning. No background task runs; failures surface to the
//!   caller (and from there to the request path as 503).
//! - **Batched** (positive interval): `append` sends the frame into a
//!   bounded ring; a full ring blocks the producer until the writer drains
//!   a slot. A single writer task wakes on arrival or on the flush-interval
//!   tick, drains the ring to empty, and issues one fsync per drain:
//!   group commit with a bounded window.
//!
//! ```text
//! handler ──┐
//! handler ──┤──► ring (bounded mpsc) ──► writer ──► write ──► fsync
//! handler ──┘                              │
//!                                rewrite / shutdown msgs
//! ```
//!
//! Rewrite swaps the log for a minimal one reconstructed from live state:
//! tmp file + fsync, fsync old, exclusive flock on the `.lock` sidecar,
//! atomic rename, reopen. Workers (re)opening the log for append take a
//! shared flock on the sidecar so they can never race the swap window.

use crate::index::Index;
use crate::persistence::record::{encode_frame, RecordReader};
use crate::persistence::PersistError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct AofConfig {
    pub path: PathBuf,
    /// Rounded up to a power of two.
    pub ring_capacity: usize,
    /// Zero selects sync mode.
    pub flush_interval: Duration,
}

#[derive(Debug)]
enum AofMessage {
    Append {
        frame: bytes::BytesMut,
    },
    Rewrite {
        entries: Vec<(i32, Vec<u8>)>,
        ack: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum Mode {
    Sync { file: Arc<Mutex<File>> },
    Batched { tx: mpsc::Sender<AofMessage> },
}

#[derive(Debug)]
pub struct Aof {
    path: PathBuf,
    mode: Mode,
}

/// Resolves when an in-flight rewrite has swapped the log.
pub struct RewriteAck(oneshot::Receiver<Result<(), PersistError>>);

impl RewriteAck {
    pub async fn wait(self) -> Result<(), PersistError> {
        self.0.await.unwrap_or(Err(PersistError::WriterClosed))
    }
}

impl Aof {
    /// Open the log for appending; in batched mode this also spawns the
    /// writer task (requires a tokio runtime).
    pub fn open(cfg: AofConfig) -> Result<Aof, PersistError> {
        let file = open_append(&cfg.path)?;

        if cfg.flush_interval.is_zero() {
            info!(path = %cfg.path.display(), "AOF open (sync mode)");
            return Ok(Aof {
                path: cfg.path,
                mode: Mode::Sync {
                    file: Arc::new(Mutex::new(file)),
                },
            });
        }

        let capacity = cfg.ring_capacity.max(2).next_power_of_two();
        let (tx, rx) = mpsc::channel(capacity);
        let writer = Writer {
            file,
            path: cfg.path.clone(),
            rx,
            flush_interval: cfg.flush_interval,
            dirty: false,
        };
        tokio::spawn(writer.run());

        info!(
            path = %cfg.path.display(),
            ring = capacity,
            flush_ms = cfg.flush_interval.as_millis() as u64,
            "AOF open (batched mode)"
        );
        Ok(Aof {
            path: cfg.path,
            mode: Mode::Batched { tx },
        })
    }

    /// Replay the log at `path` into `index`. A missing file is a valid
    /// empty state; a torn or corrupt record is terminal.
    pub fn load(path: &Path, index: &mut Index) -> Result<usize, PersistError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reader = RecordReader::new(BufReader::new(file));
        let mut count = 0usize;
        while let Some((key, value)) = reader.next_record()? {
            index.save(key, &value);
            count += 1;
        }
        Ok(count)
    }

    /// Append one record. Sync mode: durable on return. Batched mode:
    /// enqueued on return; a full ring blocks until the writer catches up.
    pub async fn append(&self, key: i32, value: &[u8]) -> Result<(), PersistError> {
        let frame = encode_frame(key, value);
        match &self.mode {
            Mode::Sync { file } => {
                let mut f = file.lock();
                write_frame(&mut f, &frame)?;
                f.sync_all()?;
                Ok(())
            }
            Mode::Batched { tx } => tx
                .send(AofMessage::Append { frame })
                .await
                .map_err(|_| PersistError::WriterClosed),
        }
    }

    /// Start a rewrite that replaces the log with one record per entry of
    /// the given frozen view. In sync mode the view is ignored: the log on
    /// disk is the authoritative source, so a scratch index is reloaded
    /// from it first.
    pub async fn rewrite(&self, entries: Vec<(i32, Vec<u8>)>) -> Result<RewriteAck, PersistError> {
        match &self.mode {
            Mode::Batched { tx } => {
                let (ack_tx, ack_rx) = oneshot::channel();
                tx.send(AofMessage::Rewrite {
                    entries,
                    ack: ack_tx,
                })
                .await
                .map_err(|_| PersistError::WriterClosed)?;
                Ok(RewriteAck(ack_rx))
            }
            Mode::Sync { file } => {
                let file = Arc::clone(file);
                let path = self.path.clone();
                let (ack_tx, ack_rx) = oneshot::channel();
                tokio::task::spawn_blocking(move || {
                    let _ = ack_tx.send(rewrite_sync(&path, &file));
                });
                Ok(RewriteAck(ack_rx))
            }
        }
    }

    /// Stop the engine cleanly: drain, fsync, close.
    pub async fn shutdown(&self) {
        match &self.mode {
            Mode::Sync { file } => {
                let f = file.lock();
                let _ = f.sync_all();
            }
            Mode::Batched { tx } => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if tx.send(AofMessage::Shutdown { ack: ack_tx }).await.is_ok() {
                    let _ = ack_rx.await;
                }
            }
        }
    }
}

// ============================================================================
// Batched writer task
// ============================================================================

enum Wakeup {
    Message(Option<AofMessage>),
    FlushTick,
}

struct Writer {
    file: File,
    path: PathBuf,
    rx: mpsc::Receiver<AofMessage>,
    flush_interval: Duration,
    dirty: bool,
}

impl Writer {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let wakeup = tokio::select! {
                msg = self.rx.recv() => Wakeup::Message(msg),
                _ = ticker.tick() => Wakeup::FlushTick,
            };
            match wakeup {
                Wakeup::Message(None) => {
                    // All senders gone; flush what we have and stop.
                    self.sync();
                    break;
                }
                Wakeup::Message(Some(msg)) => {
                    let shutdown = self.drain(msg);
                    if self.dirty {
                        self.sync();
                    }
                    if shutdown {
                        break;
                    }
                }
                Wakeup::FlushTick => {
                    if self.dirty {
                        self.sync();
                    }
                }
            }
        }
        info!("AOF writer exiting");
    }

    /// Process `first` plus everything already queued. Returns true on
    /// shutdown.
    fn drain(&mut self, first: AofMessage) -> bool {
        let mut msg = first;
        loop {
            match msg {
                AofMessage::Append { frame } => {
                    match write_frame(&mut self.file, &frame) {
                        // Batched appends were acknowledged at enqueue; a
                        // failure here can only be reported.
                        Err(e) => error!(error = %e, "AOF background write failed"),
                        Ok(()) => self.dirty = true,
                    }
                }
                AofMessage::Rewrite { entries, ack } => {
                    let result = self.do_rewrite(entries);
                    if let Err(ref e) = result {
                        error!(error = %e, "AOF rewrite failed");
                    }
                    let _ = ack.send(result);
                }
                AofMessage::Shutdown { ack } => {
                    self.sync();
                    let _ = ack.send(());
                    return true;
                }
            }
            match self.rx.try_recv() {
                Ok(next) => msg = next,
                Err(_) => return false,
            }
        }
    }

    fn sync(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!(error = %e, "AOF fsync failed");
        }
        self.dirty = false;
    }

    fn do_rewrite(&mut self, entries: Vec<(i32, Vec<u8>)>) -> Result<(), PersistError> {
        let tmp = tmp_path(&self.path);
        write_records_to(&tmp, entries.iter().map(|(k, v)| (*k, v.as_slice())))?;

        // Every frame enqueued before the rewrite message is already on the
        // old file; settle it before the swap.
        self.file.sync_all()?;

        let _lock = FlockGuard::exclusive(&lock_path(&self.path))?;
        std::fs::rename(&tmp, &self.path)?;
        // Reopen without the shared sidecar lock: we hold the exclusive one.
        self.file = reopen_append(&self.path)?;
        self.dirty = false;

        info!(records = entries.len(), path = %self.path.display(), "AOF rewritten");
        Ok(())
    }
}

// ============================================================================
// Sync-mode rewrite
// ============================================================================

fn rewrite_sync(path: &Path, file: &Arc<Mutex<File>>) -> Result<(), PersistError> {
    // Holding the file mutex quiesces appenders for the whole swap.
    let mut f = file.lock();

    // The log itself is authoritative in sync mode: records durable on disk
    // may not all be visible in the index of the worker initiating the
    // compaction. Reload a scratch view first.
    let mut scratch = Index::new();
    Aof::load(path, &mut scratch)?;

    let tmp = tmp_path(path);
    write_records_to(&tmp, scratch.iter())?;

    f.sync_all()?;
    let _lock = FlockGuard::exclusive(&lock_path(path))?;
    std::fs::rename(&tmp, path)?;
    *f = reopen_append(path)?;

    info!(records = scratch.len(), path = %path.display(), "AOF rewritten (sync mode)");
    Ok(())
}

// ============================================================================
// File helpers
// ============================================================================

/// One `write(2)` per record: `O_APPEND` then guarantees sibling workers'
/// records never interleave.
fn write_frame(file: &mut File, frame: &[u8]) -> Result<(), PersistError> {
    let n = file.write(frame)?;
    if n != frame.len() {
        return Err(PersistError::PartialWrite {
            expected: frame.len(),
            actual: n,
        });
    }
    Ok(())
}

/// Write `entries` as framed records to a fresh file at `path`, fsynced.
fn write_records_to<'a, I>(path: &Path, entries: I) -> Result<(), PersistError>
where
    I: Iterator<Item = (i32, &'a [u8])>,
{
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    let mut w = BufWriter::new(file);
    for (key, value) in entries {
        w.write_all(&encode_frame(key, value))?;
    }
    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Open the log for appending, holding a shared sidecar lock for the
/// duration of the open so it cannot race a rewrite's rename window.
fn open_append(path: &Path) -> Result<File, PersistError> {
    let _guard = FlockGuard::shared(&lock_path(path))?;
    reopen_append(path)
}

fn reopen_append(path: &Path) -> Result<File, PersistError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Advisory lock on the sidecar; released when dropped (the descriptor
/// closes).
struct FlockGuard {
    _file: File,
}

impl FlockGuard {
    fn shared(path: &Path) -> Result<Self, PersistError> {
        Self::acquire(path, libc::LOCK_SH)
    }

    fn exclusive(path: &Path) -> Result<Self, PersistError> {
        Self::acquire(path, libc::LOCK_EX)
    }

    fn acquire(path: &Path, op: libc::c_int) -> Result<Self, PersistError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(FlockGuard { _file: file })
    }
}
