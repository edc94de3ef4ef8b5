//! Per-worker bootstrap: index, persistence, CPU pin, HTTP loop.

pub mod routes;

use crate::config::Config;
use crate::index::Index;
use crate::persistence::{Persistence, SharedIndex};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{error, info, warn};

/// State shared by the HTTP handlers of one worker.
#[derive(Clone)]
pub struct AppState {
    pub index: SharedIndex,
    pub persistence: Arc<Persistence>,
}

/// Run one worker to completion and return its exit code. Exit 2 means the
/// persistence layer refused to start on a corrupt RDB or AOF.
pub async fn run_worker(cfg: &Config, worker_id: usize) -> i32 {
    let index: SharedIndex = Arc::new(tokio::sync::RwLock::new(Index::new()));
    let persistence = match boot_persistence(cfg, worker_id, &index).await {
        Ok(p) => p,
        Err(code) => return code,
    };

    let app = routes::router(AppState {
        index,
        persistence: persistence.clone(),
    });

    let listener = match bind_shared(cfg.port) {
        Ok(l) => l,
        Err(e) => {
            error!(worker = worker_id, port = cfg.port, error = %e, "bind failed");
            persistence.shutdown().await;
            return 1;
        }
    };
    pin_to_cpu(worker_id);
    info!(worker = worker_id, port = cfg.port, "worker serving");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    persistence.shutdown().await;
    match result {
        Ok(()) => {
            info!(worker = worker_id, "worker exiting");
            0
        }
        Err(e) => {
            error!(worker = worker_id, error = %e, "server error");
            1
        }
    }
}

/// Restore the worker's persistence, mapping failures to its exit code:
/// corrupt files refuse startup with 2, anything else is 1.
async fn boot_persistence(
    cfg: &Config,
    worker_id: usize,
    index: &SharedIndex,
) -> Result<Arc<Persistence>, i32> {
    match Persistence::init(cfg.persistence(), index.clone()).await {
        Ok(p) => Ok(Arc::new(p)),
        Err(e) if e.is_corruption() => {
            error!(worker = worker_id, error = %e, "refusing to start");
            Err(2)
        }
        Err(e) => {
            error!(worker = worker_id, error = %e, "persistence init failed");
            Err(1)
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

/// Bind with `SO_REUSEPORT` so every sibling worker can accept on the same
/// port; the kernel load-balances connections across them.
fn bind_shared(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(worker_id: usize) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cpu = worker_id % cores;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!(worker = worker_id, cpu, "CPU pinning failed");
        } else {
            info!(worker = worker_id, cpu, "pinned to CPU");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_worker_id: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::persistence::record::encode_frame;
    use clap::Parser;
    use tempfile::TempDir;

    fn test_config(dir: &std::path::Path) -> Config {
        let args = Args::parse_from([
            "ramforge",
            "--workers",
            "0",
            "--aof",
            "always",
            "--dir",
            dir.to_str().unwrap(),
        ]);
        Config::resolve(&args)
    }

    fn shared() -> SharedIndex {
        Arc::new(tokio::sync::RwLock::new(Index::new()))
    }

    #[tokio::test]
    async fn boot_maps_corruption_to_exit_2() {
        let dir = TempDir::new().unwrap();
        let frame = encode_frame(1, b"neo");
        std::fs::write(dir.path().join("append.aof"), &frame[..frame.len() - 1]).unwrap();

        let code = boot_persistence(&test_config(dir.path()), 0, &shared())
            .await
            .unwrap_err();
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn boot_maps_other_failures_to_exit_1() {
        // A data directory that does not exist fails the append open with a
        // plain I/O error, not corruption.
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir.path().join("missing"));

        let code = boot_persistence(&cfg, 0, &shared()).await.unwrap_err();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn boot_succeeds_on_a_clean_directory() {
        let dir = TempDir::new().unwrap();
        let index = shared();

        let persistence = boot_persistence(&test_config(dir.path()), 0, &index)
            .await
            .expect("clean boot");
        persistence.shutdown().await;
    }
}
