//! Supervisor: spawns, monitors, and drains the worker processes.
//!
//! Workers are full OS processes (the binary re-executed with
//! `--worker-id`), so they share no memory; the on-disk log is their only
//! coordination point. The parent's life cycle:
//!
//! ```text
//! BOOT ──(all workers spawned)──► RUNNING
//! RUNNING ──(SIGINT | SIGTERM | any worker exit)──► DRAIN
//! DRAIN ──(last worker reaped)──► DONE
//! ```
//!
//! Policy is fail-fast: any worker exit, clean or not, stops the whole
//! cluster. There is no restart-on-crash.

use crate::config::Config;
use crate::server;
use std::process::{Child, Command};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

struct Worker {
    id: usize,
    child: Child,
}

/// Run the cluster to completion and return the process exit code.
pub async fn start(cfg: Config) -> i32 {
    if cfg.workers == 0 {
        info!("single-process mode (no supervisor)");
        return server::run_worker(&cfg, 0).await;
    }

    match supervise(&cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "supervisor failed");
            1
        }
    }
}

async fn supervise(cfg: &Config) -> std::io::Result<i32> {
    let exe = std::env::current_exe()?;

    let mut workers = Vec::with_capacity(cfg.workers);
    for id in 0..cfg.workers {
        let child = Command::new(&exe).args(cfg.worker_args(id)).spawn()?;
        info!(worker = id, pid = child.id(), "worker spawned");
        workers.push(Worker { id, child });
    }
    info!(workers = cfg.workers, port = cfg.port, "cluster running");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut draining = false;
    let mut exit_code = 0;

    while !workers.is_empty() {
        tokio::select! {
            _ = sigint.recv() => {
                if !draining {
                    info!("SIGINT received, draining cluster");
                    draining = true;
                    terminate(&workers);
                }
            }
            _ = sigterm.recv() => {
                if !draining {
                    info!("SIGTERM received, draining cluster");
                    draining = true;
                    terminate(&workers);
                }
            }
            _ = ticker.tick() => {
                let mut exited = false;
                let mut fatal_code = None;

                workers.retain_mut(|w| match w.child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        exited = true;
                        if status.success() {
                            info!(worker = w.id, "worker exited normally");
                        } else {
                            match status.code() {
                                Some(code) => {
                                    error!(worker = w.id, code, "worker exited abnormally");
                                    fatal_code = Some(code);
                                }
                                None => {
                                    error!(worker = w.id, "worker killed by signal");
                                    fatal_code = Some(1);
                                }
                            }
                        }
                        false
                    }
                    Err(e) => {
                        warn!(worker = w.id, error = %e, "wait failed, dropping worker");
                        false
                    }
                });

                if exited && !draining {
                    // Any exit stops the cluster; abnormal ones set the code.
                    if let Some(code) = fatal_code {
                        error!("worker failure is fatal, draining cluster");
                        exit_code = code;
                    } else {
                        info!("worker exited, draining cluster");
                    }
                    draining = true;
                    terminate(&workers);
                } else if let Some(code) = fatal_code {
                    exit_code = code;
                }
            }
        }
    }

    info!(code = exit_code, "cluster stopped, all workers reaped");
    Ok(exit_code)
}

fn terminate(workers: &[Worker]) {
    for w in workers {
        info!(worker = w.id, pid = w.child.id(), "SIGTERM to worker");
        unsafe {
            libc::kill(w.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }
}
