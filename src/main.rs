//! reuseport-echo: a supervised pool of TCP echo workers
//!
//! One binary, three roles:
//! - `supervisor` (default): keeps N worker processes alive, replacing any that exit
//! - `worker`: accepts connections on the shared port and echoes every byte back
//! - `client`: connects, sends one message and logs the replies
//!
//! Features:
//! - Kernel load balancing across workers via SO_REUSEPORT
//! - Immediate respawn by default, optional exponential backoff
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod error;
mod runtime;
mod shutdown;
mod supervisor;

use config::{ClientConfig, Config, Role, SupervisorConfig, WorkerConfig};
use supervisor::{ProcessSpawner, Supervisor};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Supervisor(supervisor) => run_supervisor(supervisor, &config.log_level),
        Role::Worker(worker) => run_worker(worker),
        Role::Client(client) => run_client(client),
    }
}

/// Start the pool and supervise it until SIGTERM/SIGINT.
fn run_supervisor(config: SupervisorConfig, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.worker.host,
        port = config.worker.port,
        workers = config.workers,
        restart = ?config.restart,
        "Starting reuseport-echo supervisor"
    );

    // Fail early on an unusable address instead of crash-looping workers.
    config.worker.addr()?;

    let shutdown = shutdown::install()?;
    let spawner = ProcessSpawner::for_worker(&config.worker, log_level)?;
    let mut supervisor = Supervisor::new(spawner, config.workers, config.restart);
    supervisor.start()?;
    info!(
        live = supervisor.live(),
        target = supervisor.target(),
        workers = ?supervisor.worker_ids(),
        pids = ?supervisor.pids(),
        "Worker pool started"
    );
    supervisor.run(shutdown)?;
    Ok(())
}

/// Serve on the shared port until SIGTERM/SIGINT.
fn run_worker(config: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = shutdown::exit_with_parent() {
        warn!(error = %e, "Could not tie worker lifetime to supervisor");
    }
    let shutdown = shutdown::install()?;
    if let Err(e) = runtime::run(&config, shutdown) {
        error!(pid = std::process::id(), error = %e, "Worker failed");
        return Err(e.into());
    }
    Ok(())
}

fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(client::run(&config))?;
    Ok(())
}
