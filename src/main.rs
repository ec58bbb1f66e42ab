use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use course_forge::config;
use course_forge::db;
use course_forge::generation::ProviderClient;
use course_forge::janitor::{Janitor, JanitorConfig};
use course_forge::pipeline::Pipeline;
use course_forge::worker::{spawn_workers, Generators};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run course generation workers and the stale-job janitor")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override `app.workers`
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let pipeline = Pipeline::from_config(pool, &cfg);
    let provider = ProviderClient::from_config(&cfg.provider).context("build provider client")?;
    let generators = Generators::provider(provider);

    let shutdown = CancellationToken::new();
    let workers = args.workers.unwrap_or(cfg.app.workers);
    let idle = Duration::from_millis(cfg.app.poll_interval_ms);
    let mut handles = spawn_workers(
        workers,
        pipeline.orchestrator(),
        &generators,
        &shutdown,
        idle,
    );
    let janitor = Janitor::new(pipeline.orchestrator().clone(), JanitorConfig::from(&cfg.jobs));
    handles.push(janitor.start(shutdown.clone()));

    info!(workers, "course generation service started");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            error!(?err, "task panicked during shutdown");
        }
    }
    Ok(())
}
