//! Job orchestrator: submission, claiming, progress, terminal transitions,
//! retries, cancellation and parent/child aggregation.
//!
//! Every transition is a compare-and-set on the stored status, so late or
//! duplicate callbacks from workers degrade into no-ops instead of errors.
//!
//! ```text
//! queued -> processing           claim
//! processing -> processing       progress (percent never decreases)
//! processing -> completed        complete
//! processing -> failed           permanent error, retry budget exhausted, stale
//! processing -> queued           transient error with budget left (backoff)
//! queued|processing -> cancelled cancel (cascades to children)
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, JobFilter, NewJob, Pool, Tx};
use crate::error::{PipelineError, Result};
use crate::generation::GenerationError;
use crate::model::{
    CourseOutline, GenerationJob, JobPayload, JobStatus, JobType, LessonPayload,
};
use crate::notify::Notifier;
use crate::retry::RetryPolicy;

/// Result of a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Stored; carries the new percent.
    Applied(i32),
    /// Older than what is stored; only the heartbeat moved.
    Regressed(i32),
    /// The job is not running (or not for this worker); nothing changed.
    Ignored(JobStatus),
}

/// Result of a terminal transition request.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(GenerationJob),
    /// The job had already reached a terminal state; it is returned as stored.
    AlreadyTerminal(GenerationJob),
}

impl TransitionOutcome {
    pub fn job(&self) -> &GenerationJob {
        match self {
            TransitionOutcome::Applied(job) | TransitionOutcome::AlreadyTerminal(job) => job,
        }
    }

    pub fn into_job(self) -> GenerationJob {
        match self {
            TransitionOutcome::Applied(job) | TransitionOutcome::AlreadyTerminal(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// What happened to a job after its stage raised an error.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    Retrying {
        retry_count: i32,
        run_at: DateTime<Utc>,
    },
    Terminal(TransitionOutcome),
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    pool: Pool,
    notifier: Notifier,
    retry: RetryPolicy,
    default_max_retries: i32,
    running: Arc<DashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(pool: Pool, notifier: Notifier, retry: RetryPolicy, default_max_retries: i32) -> Self {
        Self {
            pool,
            notifier,
            retry,
            default_max_retries: default_max_retries.max(1),
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config(pool: Pool, notifier: Notifier, cfg: &Config) -> Self {
        Self::new(
            pool,
            notifier,
            RetryPolicy::from_config(&cfg.jobs),
            cfg.jobs.max_retries,
        )
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    #[instrument(skip_all, fields(user_id = %user_id, kind = payload.job_type().as_str()))]
    pub async fn submit(
        &self,
        tenant_id: &str,
        user_id: &str,
        payload: JobPayload,
    ) -> Result<GenerationJob> {
        payload.validate()?;
        let job = db::insert_job(
            &self.pool,
            &self.new_job(tenant_id, user_id, None, payload),
            Utc::now(),
        )
        .await?;
        self.announce(&job);
        Ok(job)
    }

    /// Insert a job inside the caller's transaction. The caller publishes it
    /// with `announce` once the transaction commits.
    pub async fn submit_in(
        &self,
        tx: &mut Tx<'_>,
        tenant_id: &str,
        user_id: &str,
        payload: JobPayload,
    ) -> Result<GenerationJob> {
        payload.validate()?;
        let job = db::insert_job(
            &mut **tx,
            &self.new_job(tenant_id, user_id, None, payload),
            Utc::now(),
        )
        .await?;
        Ok(job)
    }

    pub fn announce(&self, job: &GenerationJob) {
        info!(job_id = %job.id, kind = job.job_type.as_str(), "job queued");
        self.notifier.publish_status(job);
    }

    fn new_job(
        &self,
        tenant_id: &str,
        user_id: &str,
        parent_job_id: Option<String>,
        payload: JobPayload,
    ) -> NewJob {
        NewJob {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            parent_job_id,
            payload,
            max_retries: self.default_max_retries,
        }
    }

    pub async fn get_job(&self, id: &str) -> Result<GenerationJob> {
        db::fetch_job(&self.pool, id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<GenerationJob>> {
        Ok(db::list_jobs(&self.pool, filter).await?)
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<GenerationJob>> {
        Ok(db::list_children(&self.pool, parent_id).await?)
    }

    /// Claim the next due job for `worker_id`.
    #[instrument(skip_all, fields(worker = %worker_id))]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<GenerationJob>> {
        let Some(job) = db::claim_next_job(&self.pool, worker_id, Utc::now()).await? else {
            return Ok(None);
        };
        self.running
            .insert(job.id.clone(), CancellationToken::new());
        info!(
            job_id = %job.id,
            kind = job.job_type.as_str(),
            attempt = job.retry_count + 1,
            "job claimed"
        );
        self.notifier.publish_status(&job);
        Ok(Some(job))
    }

    /// Token the executing worker observes for cooperative cancellation.
    pub fn cancellation_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.running.get(job_id).map(|t| t.clone())
    }

    fn release(&self, job_id: &str) {
        self.running.remove(job_id);
    }

    fn signal_cancel(&self, job_id: &str) {
        if let Some((_, token)) = self.running.remove(job_id) {
            token.cancel();
        }
    }

    pub async fn report_progress(
        &self,
        id: &str,
        percent: i32,
        message: Option<&str>,
    ) -> Result<ProgressOutcome> {
        self.report_progress_from(id, None, percent, message).await
    }

    /// Progress report from `worker_id` (or from anyone when `None`). Reports
    /// for jobs that are not `processing` are silently ignored.
    pub async fn report_progress_from(
        &self,
        id: &str,
        worker_id: Option<&str>,
        percent: i32,
        message: Option<&str>,
    ) -> Result<ProgressOutcome> {
        if !(0..=100).contains(&percent) {
            return Err(PipelineError::validation(format!(
                "progress percent {percent} is outside 0..=100"
            )));
        }
        let stored =
            db::update_progress(&self.pool, id, worker_id, percent, message, Utc::now()).await?;
        let Some(stored) = stored else {
            let job = self.get_job(id).await?;
            debug!(job_id = id, status = job.status.as_str(), "progress ignored");
            return Ok(ProgressOutcome::Ignored(job.status));
        };

        if let Some(job) = db::fetch_job(&self.pool, id).await? {
            self.notifier.publish_status(&job);
            if let Some(parent) = job.parent_job_id.as_deref() {
                self.aggregate_parent(parent).await?;
            }
        }
        if stored > percent {
            Ok(ProgressOutcome::Regressed(stored))
        } else {
            Ok(ProgressOutcome::Applied(stored))
        }
    }

    pub async fn complete(&self, id: &str, result: Value, tokens_used: i64) -> Result<TransitionOutcome> {
        let applied =
            db::mark_completed(&self.pool, id, &result, tokens_used, Utc::now()).await?;
        self.settle(id, applied).await
    }

    pub async fn fail(&self, id: &str, error_message: &str) -> Result<TransitionOutcome> {
        let applied =
            db::mark_failed(&self.pool, id, error_message, None, 0, Utc::now()).await?;
        self.settle(id, applied).await
    }

    /// Resolve a terminal CAS that the caller just attempted. When it applied,
    /// runs the follow-up (notification, parent aggregation); otherwise the
    /// stored state is returned untouched.
    pub async fn settle(&self, id: &str, applied: bool) -> Result<TransitionOutcome> {
        let job = self.get_job(id).await?;
        if applied {
            info!(
                job_id = %job.id,
                kind = job.job_type.as_str(),
                status = job.status.as_str(),
                "job finished"
            );
            self.after_terminal(&job).await?;
            return Ok(TransitionOutcome::Applied(job));
        }
        self.release(id);
        if job.is_terminal() {
            debug!(job_id = id, status = job.status.as_str(), "already terminal");
            Ok(TransitionOutcome::AlreadyTerminal(job))
        } else {
            Err(PipelineError::precondition(format!(
                "job {id} is {}, not processing",
                job.status.as_str()
            )))
        }
    }

    async fn after_terminal(&self, job: &GenerationJob) -> Result<()> {
        self.release(&job.id);
        self.notifier.on_job_terminal(job).await;
        if let Some(parent) = job.parent_job_id.as_deref() {
            self.aggregate_parent(parent).await?;
        }
        Ok(())
    }

    /// Apply the retry policy to a stage error raised while running `job`.
    ///
    /// `max_retries` bounds the total number of attempts: a transient error
    /// on attempt `n < max_retries` re-queues the job with backoff, and the
    /// error on attempt `max_retries` fails it with that error preserved.
    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.retry_count + 1))]
    pub async fn handle_failure(
        &self,
        job: &GenerationJob,
        err: &GenerationError,
    ) -> Result<FailureOutcome> {
        let now = Utc::now();
        let applied = match err {
            GenerationError::Cancelled => {
                return Ok(FailureOutcome::Terminal(self.settle(&job.id, false).await?));
            }
            GenerationError::Transient(msg) => {
                let attempts = job.retry_count + 1;
                if attempts < job.max_retries {
                    let delay = self.retry.delay_for(job.retry_count.max(0) as u32);
                    let run_at = now
                        + chrono::Duration::from_std(delay)
                            .map_err(|e| PipelineError::Store(e.into()))?;
                    let requeued = db::requeue_for_retry(
                        &self.pool,
                        &job.id,
                        attempts,
                        run_at,
                        &format!("retrying after transient error: {msg}"),
                        0,
                    )
                    .await?;
                    if requeued {
                        self.release(&job.id);
                        warn!(retry_count = attempts, ?delay, "transient failure, job re-queued: {msg}");
                        if let Some(job) = db::fetch_job(&self.pool, &job.id).await? {
                            self.notifier.publish_status(&job);
                        }
                        return Ok(FailureOutcome::Retrying {
                            retry_count: attempts,
                            run_at,
                        });
                    }
                    return Ok(FailureOutcome::Terminal(self.settle(&job.id, false).await?));
                }
                warn!(attempts, "retry budget exhausted: {msg}");
                db::mark_failed(
                    &self.pool,
                    &job.id,
                    &format!("{} (after {attempts} attempts)", PipelineError::TransientProvider(msg.clone())),
                    Some(attempts),
                    0,
                    now,
                )
                .await?
            }
            GenerationError::Permanent(msg) => {
                warn!("permanent failure: {msg}");
                db::mark_failed(
                    &self.pool,
                    &job.id,
                    &PipelineError::PermanentProvider(msg.clone()).to_string(),
                    None,
                    0,
                    now,
                )
                .await?
            }
        };
        Ok(FailureOutcome::Terminal(self.settle(&job.id, applied).await?))
    }

    /// Cooperative cancellation. Marks the job (and, for a parent, every live
    /// child) `cancelled` and signals the executing workers to stop at their
    /// next checkpoint.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn cancel(&self, id: &str) -> Result<TransitionOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let applied = db::mark_cancelled(&mut *tx, id, now).await?;
        let children = if applied {
            db::cancel_children(&mut *tx, id, now).await?
        } else {
            Vec::new()
        };
        tx.commit().await?;

        let job = self.get_job(id).await?;
        if !applied {
            return Ok(TransitionOutcome::AlreadyTerminal(job));
        }
        info!(children = children.len(), "job cancelled");
        self.signal_cancel(id);
        for child_id in &children {
            self.signal_cancel(child_id);
            if let Some(child) = db::fetch_job(&self.pool, child_id).await? {
                self.notifier.publish_status(&child);
            }
        }
        self.notifier.on_job_terminal(&job).await;
        if let Some(parent) = job.parent_job_id.as_deref() {
            self.aggregate_parent(parent).await?;
        }
        Ok(TransitionOutcome::Applied(job))
    }

    /// Create one `lesson_content` child per outline lesson that does not
    /// already have one. Safe to re-run after a crash.
    #[instrument(skip_all, fields(job_id = %parent.id))]
    pub async fn fan_out_full_course(
        &self,
        parent: &GenerationJob,
        outline: &CourseOutline,
    ) -> Result<Vec<GenerationJob>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        if !db::touch_job(&mut *tx, &parent.id, now).await? {
            tx.rollback().await?;
            return Err(PipelineError::Cancelled);
        }
        let existing = db::list_children(&mut *tx, &parent.id).await?;
        let mut created = Vec::new();
        for (section, lesson) in outline.lessons() {
            let scheduled = existing.iter().any(|child| match &child.payload {
                JobPayload::LessonContent(p) => p.lesson_id == lesson.id,
                _ => false,
            });
            if scheduled {
                continue;
            }
            let payload = JobPayload::LessonContent(LessonPayload {
                course_id: outline.course_id.clone(),
                outline_id: outline.id.clone(),
                section_id: section.id.clone(),
                lesson_id: lesson.id.clone(),
            });
            let mut new = self.new_job(
                &parent.tenant_id,
                &parent.user_id,
                Some(parent.id.clone()),
                payload,
            );
            new.max_retries = parent.max_retries;
            created.push(db::insert_job(&mut *tx, &new, now).await?);
        }
        tx.commit().await?;

        info!(
            created = created.len(),
            total = outline.lesson_count(),
            "lesson jobs scheduled"
        );
        for child in &created {
            self.notifier.publish_status(child);
        }
        Ok(created)
    }

    /// Recompute a parent from one consistent snapshot of its children:
    /// progress is their mean, and once every child is terminal the parent
    /// completes (all completed) or fails naming each unsuccessful child.
    #[instrument(skip_all, fields(job_id = %parent_id))]
    pub async fn aggregate_parent(&self, parent_id: &str) -> Result<Option<TransitionOutcome>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        // Write first so the transaction holds the lock for the whole snapshot.
        if !db::touch_job(&mut *tx, parent_id, now).await? {
            tx.rollback().await?;
            return Ok(None);
        }
        let children = db::list_children(&mut *tx, parent_id).await?;
        if children.is_empty() {
            tx.commit().await?;
            return Ok(None);
        }

        let total = children.len();
        let mean = children
            .iter()
            .map(|c| c.progress_percent as i64)
            .sum::<i64>()
            / total as i64;
        let finished = children.iter().filter(|c| c.is_terminal()).count();
        let unsuccessful: Vec<&GenerationJob> = children
            .iter()
            .filter(|c| c.is_terminal() && c.status != JobStatus::Completed)
            .collect();
        let tokens: i64 = children.iter().map(|c| c.tokens_used).sum();

        let mut transitioned = false;
        if finished == total {
            if unsuccessful.is_empty() {
                let result = json!({
                    "lessons_completed": total,
                    "lesson_job_ids": children.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
                });
                transitioned = db::mark_completed(&mut *tx, parent_id, &result, tokens, now).await?;
            } else {
                let message = aggregate_error(&unsuccessful, total);
                transitioned =
                    db::mark_failed(&mut *tx, parent_id, &message, None, tokens, now).await?;
            }
        } else {
            let progress = format!("{finished} of {total} lessons finished");
            db::update_progress(
                &mut *tx,
                parent_id,
                None,
                mean.clamp(0, 99) as i32,
                Some(&progress),
                now,
            )
            .await?;
        }
        tx.commit().await?;

        let parent = self.get_job(parent_id).await?;
        if transitioned {
            info!(
                status = parent.status.as_str(),
                failed = unsuccessful.len(),
                total,
                "parent job finished"
            );
            self.release(parent_id);
            self.notifier.on_job_terminal(&parent).await;
            return Ok(Some(TransitionOutcome::Applied(parent)));
        }
        self.notifier.publish_status(&parent);
        Ok(None)
    }

    /// Settle every `processing` job whose last checkpoint is older than
    /// `cutoff`. A parent whose children are all terminal missed its last
    /// aggregation and is re-aggregated; everything else is failed as stale.
    #[instrument(skip_all)]
    pub async fn fail_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<GenerationJob>> {
        let stale = db::list_stale_jobs(&self.pool, cutoff).await?;
        let mut failed = Vec::new();
        for job in stale {
            if job.job_type == JobType::FullCourse
                && !db::list_children(&self.pool, &job.id).await?.is_empty()
            {
                if let Some(TransitionOutcome::Applied(parent)) =
                    self.aggregate_parent(&job.id).await?
                {
                    warn!(
                        job_id = %parent.id,
                        status = parent.status.as_str(),
                        "stale parent re-aggregated"
                    );
                    failed.push(parent);
                }
                continue;
            }
            let last = job.heartbeat_at.or(job.started_at).unwrap_or(job.created_at);
            let message = PipelineError::StaleJob(format!(
                "no checkpoint since {}",
                last.to_rfc3339()
            ))
            .to_string();
            let applied =
                db::mark_failed(&self.pool, &job.id, &message, None, 0, Utc::now()).await?;
            if !applied {
                continue;
            }
            warn!(job_id = %job.id, claimed_by = ?job.claimed_by, "stale job failed");
            self.signal_cancel(&job.id);
            if let TransitionOutcome::Applied(job) = self.settle(&job.id, true).await? {
                failed.push(job);
            }
        }
        Ok(failed)
    }
}

fn aggregate_error(unsuccessful: &[&GenerationJob], total: usize) -> String {
    let details: Vec<String> = unsuccessful
        .iter()
        .map(|child| {
            let lesson = match &child.payload {
                JobPayload::LessonContent(p) => p.lesson_id.as_str(),
                _ => "?",
            };
            let reason = match child.status {
                JobStatus::Cancelled => "cancelled",
                _ => child.error_message.as_deref().unwrap_or("failed"),
            };
            format!("lesson {lesson} (job {}): {reason}", child.id)
        })
        .collect();
    format!(
        "{} of {} lesson jobs failed: {}",
        unsuccessful.len(),
        total,
        details.join("; ")
    )
}
