//! moonmind-worker - MoonMind queue worker daemon.
//!
//! Binary entry point: configuration, preflight, then the claim loop.

use clap::Parser;
use moonmind_core::WorkerConfig;
use moonmind_worker::{preflight, Worker};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "moonmind-worker", about = "MoonMind queue worker daemon")]
struct Args {
    /// Process at most one claim cycle and exit.
    #[arg(long)]
    once: bool,

    /// Skip preflight CLI/auth verification (troubleshooting only).
    #[arg(long, env = "MOONMIND_SKIP_PREFLIGHT")]
    skip_preflight: bool,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid worker configuration");
            std::process::exit(1);
        }
    };
    let cwd = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    config.resolve_workdir(&cwd);
    if let Err(error) = std::fs::create_dir_all(&config.workdir) {
        error!(%error, workdir = %config.workdir.display(), "cannot create workdir");
        std::process::exit(1);
    }

    if args.skip_preflight {
        info!("preflight skipped by flag");
    } else if let Err(error) = preflight::run_preflight(&config) {
        error!(%error, "preflight failed");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let worker = Worker::new(config);
        if args.once {
            match worker.run_once().await {
                Ok(claimed) => {
                    info!(claimed, "single claim cycle finished");
                }
                Err(error) => {
                    error!(%error, "claim cycle failed");
                    std::process::exit(1);
                }
            }
            return;
        }

        let worker_ref = &worker;
        tokio::select! {
            result = worker.run_forever() => {
                if let Err(error) = result {
                    error!(%error, "worker loop error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                worker_ref.shutdown();
            }
        }
    });
}
