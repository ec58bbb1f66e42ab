use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use course_forge::client::{
    ControllerConfig, ControllerState, GenerationController, LocalApi, Stage,
};
use course_forge::config;
use course_forge::db;
use course_forge::generation::{FakeGenerator, ProviderClient};
use course_forge::identity::TenantScope;
use course_forge::model::OutlinePayload;
use course_forge::pipeline::Pipeline;
use course_forge::worker::{spawn_workers, Generators};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generate a course end to end: outline, approval, then every lesson"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    tenant: String,

    #[arg(long, default_value = "cli")]
    user: String,

    /// Course id; a fresh one is generated when omitted
    #[arg(long)]
    course: Option<String>,

    /// Knowledge source ids (repeatable)
    #[arg(long = "source", required = true)]
    sources: Vec<String>,

    /// Target audiences (repeatable)
    #[arg(long = "audience", required = true)]
    audiences: Vec<String>,

    #[arg(long)]
    outcomes: String,

    #[arg(long)]
    lessons: Option<u32>,

    /// Reject the first outline with this feedback before approving
    #[arg(long)]
    reject_with: Option<String>,

    /// Leave lesson generation running in the queue and exit
    #[arg(long)]
    background: bool,

    /// Use the built-in deterministic generator instead of the provider
    #[arg(long)]
    fake: bool,
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

    let generators = if args.fake {
        Generators::fake(Arc::new(FakeGenerator::new()))
    } else {
        Generators::provider(
            ProviderClient::from_config(&cfg.provider).context("build provider client")?,
        )
    };
    let shutdown = CancellationToken::new();
    let workers = spawn_workers(
        cfg.app.workers,
        pipeline.orchestrator(),
        &generators,
        &shutdown,
        Duration::from_millis(cfg.app.poll_interval_ms),
    );

    let scope = TenantScope::new(&args.tenant, &args.user);
    let api = LocalApi::new(pipeline, scope);
    let mut controller = GenerationController::new(api, ControllerConfig::from(&cfg.client));

    let input = OutlinePayload {
        course_id: args
            .course
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        knowledge_source_ids: args.sources.clone(),
        target_audiences: args.audiences.clone(),
        desired_outcomes: args.outcomes.clone(),
        lesson_count_hint: args.lessons,
        guidance: None,
    };
    info!(course_id = %input.course_id, "generating outline");
    controller.submit(input).await?;
    controller.wait_for_terminal().await?;

    if let Some(reason) = &args.reject_with {
        if matches!(controller.state(), ControllerState::ReviewOutline { .. }) {
            info!(%reason, "rejecting first outline");
            controller.reject(reason).await?;
            controller.wait_for_terminal().await?;
        }
    }

    let ControllerState::ReviewOutline { outline } = controller.state() else {
        shutdown.cancel();
        bail!("outline generation ended in state {}", controller.state().name());
    };
    info!(
        outline_id = %outline.id,
        version = outline.version,
        lessons = outline.lesson_count(),
        "approving outline"
    );
    controller.approve().await?;

    if args.background {
        controller.navigate_away()?;
        if let ControllerState::BackgroundGeneration { job_id } = controller.state() {
            println!("lesson generation continues as job {job_id}");
        }
        // Let in-flight jobs finish; the rest stays queued for the service.
        shutdown.cancel();
        for handle in workers {
            let _ = handle.await;
        }
        return Ok(());
    }

    controller.watch()?;
    controller.wait_for_terminal().await?;
    shutdown.cancel();
    for handle in workers {
        let _ = handle.await;
    }

    match controller.state() {
        ControllerState::Complete { content } => {
            println!("{}", serde_json::to_string_pretty(content)?);
            info!(
                lessons = content.lesson_count(),
                generated = content.generated_count(),
                "course complete"
            );
            Ok(())
        }
        ControllerState::Failed {
            stage: Stage::Lessons,
            error,
        } => {
            warn!("lesson generation failed");
            bail!("lesson generation failed: {error}")
        }
        other => bail!("generation ended in state {}", other.name()),
    }
}
