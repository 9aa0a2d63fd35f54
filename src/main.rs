//! CI server - main entry point.
//!
//! Loads configuration, authenticates with the forge, starts the job
//! manager and the webhook listener, and shuts down cleanly on SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ci_server::config::Config;
use ci_server::forge::ForgeApi;
use ci_server::forge::api::DEFAULT_BASE_URL;
use ci_server::job::JobDeps;
use ci_server::manager::{DEFAULT_JOB_TIME, JobManager, ManagerConfig};
use ci_server::repo::{ObjectCache, Repositories};
use ci_server::server::{AppState, build_router};

/// Webhook-driven CI dispatcher.
#[derive(Parser)]
#[command(name = "ci-server", version)]
struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("initialization failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config)?;
    tracing::info!(level = %config.log_level, "initialized logger");

    // Authenticate up front: a bad token is fatal at startup rather than a
    // surprise on the first job.
    let forge = Arc::new(ForgeApi::new(DEFAULT_BASE_URL, &config.user, &config.oauth));
    forge.authenticate().await?;
    tracing::info!(user = %config.user, "authenticated with forge");

    let cache = Arc::new(ObjectCache::new());
    let repos = Arc::new(Repositories::new());
    let deps = JobDeps {
        forge: Arc::clone(&forge),
        cache: Arc::clone(&cache),
        workspace_root: std::env::temp_dir(),
        authorized_users: Arc::new(config.authorized_users.clone()),
    };

    let shutdown = CancellationToken::new();
    let (jobs_tx, jobs_rx) = mpsc::channel(100);
    let manager = JobManager::new(ManagerConfig {
        num_workers: config.num_workers,
        job_time: DEFAULT_JOB_TIME,
    });
    let manager_handle = tokio::spawn(manager.run(shutdown.child_token(), jobs_rx));

    let app = build_router(AppState::new(repos, deps, jobs_tx));
    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!(address = %config.bind_address(), "listening for webhooks");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await?;

    // Stop accepting jobs and let running ones drain.
    shutdown.cancel();
    let _ = manager_handle.await;
    tracing::info!("server exited cleanly");
    Ok(())
}

/// Initializes tracing per the logger config: console, or a log file.
fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let level = match config.log_level.as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("ci_server={level}")));

    match config.log_target.as_str() {
        "console" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        path => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
    }
    Ok(())
}
