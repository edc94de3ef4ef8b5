//! CLI surface and resolved runtime configuration.

use crate::persistence::PersistenceConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 1109;

const AOF_FILE: &str = "append.aof";
const RDB_FILE: &str = "dump.rdb";
const BATCHED_FLUSH_MS: u64 = 10;
const SNAPSHOT_INTERVAL_SECS: u64 = 60;
const RING_CAPACITY: usize = 1 << 16;

/// RamForge, an in-memory key/value store with hybrid AOF + snapshot
/// persistence.
#[derive(Parser, Debug)]
#[command(name = "ramforge")]
#[command(about = "In-memory key/value store with durable persistence")]
pub struct Args {
    /// Worker process count; 0 runs a single unsupervised worker in-process.
    /// Defaults to the online CPU count.
    #[arg(long, env = "RAMFORGE_WORKERS")]
    pub workers: Option<usize>,

    /// AOF durability: "always" fsyncs every append; anything else selects
    /// the batched default (10 ms group commit).
    #[arg(long, default_value = "batched")]
    pub aof: String,

    /// TCP port shared by all workers.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding append.aof and dump.rdb.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Internal: run as the given worker (set by the supervisor).
    #[arg(long, hide = true)]
    pub worker_id: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub port: u16,
    pub dir: PathBuf,
    pub aof_always: bool,
}

impl Config {
    pub fn resolve(args: &Args) -> Config {
        let workers = args.workers.unwrap_or_else(online_cpus);
        let aof_always = args.aof == "always";
        if !aof_always && args.aof != "batched" {
            warn!(option = %args.aof, "unknown --aof option, using batched default");
        }
        Config {
            workers,
            port: args.port,
            dir: args.dir.clone(),
            aof_always,
        }
    }

    pub fn aof_flush_interval(&self) -> Duration {
        if self.aof_always {
            Duration::ZERO
        } else {
            Duration::from_millis(BATCHED_FLUSH_MS)
        }
    }

    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            rdb_path: self.dir.join(RDB_FILE),
            aof_path: self.dir.join(AOF_FILE),
            snapshot_interval: Duration::from_secs(SNAPSHOT_INTERVAL_SECS),
            aof_flush_interval: self.aof_flush_interval(),
            ring_capacity: RING_CAPACITY,
        }
    }

    /// Argument vector for re-executing the binary as a worker process.
    pub fn worker_args(&self, worker_id: usize) -> Vec<String> {
        vec![
            "--worker-id".into(),
            worker_id.to_string(),
            "--port".into(),
            self.port.to_string(),
            "--dir".into(),
            self.dir.display().to_string(),
            "--aof".into(),
            if self.aof_always { "always" } else { "batched" }.into(),
        ]
    }
}

fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
