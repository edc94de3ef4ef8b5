use clap::Parser;
use ramforge::config::{Args, Config};
use ramforge::{cluster, server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::resolve(&args);

    // The supervisor re-executes this binary with --worker-id for each
    // worker process; without it we are the parent.
    let code = match args.worker_id {
        Some(worker_id) => server::run_worker(&cfg, worker_id).await,
        None => cluster::start(cfg).await,
    };
    std::process::exit(code);
}
