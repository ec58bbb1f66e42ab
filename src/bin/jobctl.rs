use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use course_forge::config;
use course_forge::db::{self, JobFilter};
use course_forge::identity::TenantScope;
use course_forge::model::{GenerationJob, JobStatus, JobType};
use course_forge::pipeline::Pipeline;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and cancel generation jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    tenant: String,

    #[arg(long, default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List jobs, newest first
    List {
        /// Repeatable status filter (queued, processing, ...)
        #[arg(long)]
        status: Vec<String>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long)]
        course: Option<String>,
        /// Include lesson_content children
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Print one job as JSON, with its children
    Get { job_id: String },
    /// Cancel a queued or processing job
    Cancel { job_id: String },
    /// Per-status job counts for the tenant
    Stats,
    /// List the user's notifications
    Notifications {
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value = "20")]
        limit: i64,
        /// Mark everything read after listing
        #[arg(long)]
        mark_read: bool,
    },
}

fn summary(job: &GenerationJob) -> String {
    format!(
        "{}  {:<15} {:<10} {:>3}%  {}",
        job.id,
        job.job_type.as_str(),
        job.status.as_str(),
        job.progress_percent,
        job.error_message
            .as_deref()
            .or(job.progress_message.as_deref())
            .unwrap_or("")
    )
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
    let pipeline = Pipeline::from_config(pool.clone(), &cfg);
    let scope = TenantScope::new(&args.tenant, &args.user);

    match args.command {
        Command::List {
            status,
            job_type,
            course,
            all,
            limit,
        } => {
            let statuses = status
                .iter()
                .map(|s| JobStatus::parse(s).ok_or_else(|| anyhow!("unknown status {s}")))
                .collect::<Result<Vec<_>>>()?;
            let job_type = job_type
                .map(|t| JobType::parse(&t).ok_or_else(|| anyhow!("unknown job type {t}")))
                .transpose()?;
            let filter = JobFilter {
                statuses,
                job_type,
                course_id: course,
                top_level_only: !all,
                limit: Some(limit),
                ..JobFilter::for_tenant(&scope.tenant_id)
            };
            let jobs = pipeline.list_jobs(&scope, filter).await?;
            for job in &jobs {
                println!("{}", summary(job));
            }
            info!(count = jobs.len(), "listed jobs");
        }
        Command::Get { job_id } => {
            let job = pipeline.get_job(&scope, &job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            for child in pipeline.orchestrator().list_children(&job.id).await? {
                println!("  {}", summary(&child));
            }
        }
        Command::Cancel { job_id } => {
            let outcome = pipeline.cancel(&scope, &job_id).await?;
            let applied = outcome.is_applied();
            let job = outcome.into_job();
            if applied {
                println!("cancelled {}", job.id);
            } else {
                println!("{} already {}", job.id, job.status.as_str());
            }
        }
        Command::Stats => {
            for (status, count) in db::count_jobs_by_status(&pool, &scope.tenant_id).await? {
                println!("{status:<10} {count}");
            }
        }
        Command::Notifications {
            unread,
            limit,
            mark_read,
        } => {
            for n in pipeline.list_notifications(&scope, unread, limit).await? {
                println!(
                    "{} [{}] {:<20} {}: {}",
                    n.created_at.format("%Y-%m-%d %H:%M:%S"),
                    if n.read { " " } else { "*" },
                    n.notification_type.as_str(),
                    n.title,
                    n.message
                );
            }
            if mark_read {
                let marked = pipeline.mark_all_notifications_read(&scope).await?;
                info!(marked, "marked notifications read");
            }
        }
    }
    Ok(())
}
