use super::model::{JobFilter, NewJob, NewNotification, NewOutline};
use crate::config::expand_home;
use crate::model::{
    ApprovalStatus, CourseOutline, GeneratedLesson, GenerationJob, JobStatus, JobType,
    LessonComponent, Notification, NotificationType, OutlineSection, Priority,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

const JOB_COLUMNS: &str = "id, tenant_id, user_id, parent_job_id, course_id, job_type, status, \
     payload, result, progress_percent, progress_message, retry_count, max_retries, \
     error_message, tokens_used, run_at, claimed_by, heartbeat_at, created_at, started_at, \
     completed_at";

const OUTLINE_COLUMNS: &str = "id, tenant_id, course_id, version, approval_status, sections, \
     rejection_reason, revision_notes, source_job_id, superseded_at, created_at, updated_at";

const LESSON_COLUMNS: &str = "id, tenant_id, course_id, outline_id, section_id, \
     outline_lesson_id, title, segue_text, components, job_id, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, user_id, notification_type, priority, title, \
     message, read, read_at, course_id, job_id, task_id, sme_id, created_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        // WAL and stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory pool. Every connection to `sqlite::memory:`
/// opens its own database, so the pool must never open a second one.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Normalise a file-backed SQLite URL to `sqlite://<path>[?query]`, expanding
/// `~/` and creating the database directory. Other URLs pass through as-is.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(url.to_string());
    };
    if rest.starts_with(":memory") {
        return Ok(url.to_string());
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Ok(url.to_string());
    }

    let path = expand_home(path);
    if let Some(dir) = Path::new(&path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create database directory {}", dir.display()))?;
        }
    }
    Ok(match query {
        Some(query) => format!("sqlite://{path}?{query}"),
        None => format!("sqlite://{path}"),
    })
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

fn job_from_row(row: &SqliteRow) -> Result<GenerationJob> {
    let id: String = row.try_get("id")?;
    let job_type: String = row.try_get("job_type")?;
    let job_type = JobType::parse(&job_type)
        .ok_or_else(|| anyhow!("job {} has unknown type {}", id, job_type))?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| anyhow!("job {} has unknown status {}", id, status))?;
    let payload: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload)
        .with_context(|| format!("job {} has an invalid payload", id))?;
    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .with_context(|| format!("job {} has an invalid result", id))?;

    Ok(GenerationJob {
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        parent_job_id: row.try_get("parent_job_id")?,
        course_id: row.try_get("course_id")?,
        job_type,
        status,
        payload,
        result,
        progress_percent: row.try_get("progress_percent")?,
        progress_message: row.try_get("progress_message")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        tokens_used: row.try_get("tokens_used")?,
        run_at: row.try_get("run_at")?,
        claimed_by: row.try_get("claimed_by")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        id,
    })
}

#[instrument(skip_all)]
pub async fn insert_job<'e, E>(
    executor: E,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<GenerationJob>
where
    E: SqliteExecutor<'e>,
{
    let id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&job.payload)?;
    let row = sqlx::query(&format!(
        "INSERT INTO jobs (id, tenant_id, user_id, parent_job_id, course_id, job_type, status, \
         payload, max_retries, run_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?, ?) RETURNING {JOB_COLUMNS}"
    ))
    .bind(&id)
    .bind(&job.tenant_id)
    .bind(&job.user_id)
    .bind(job.parent_job_id.as_deref())
    .bind(job.payload.course_id())
    .bind(job.payload.job_type().as_str())
    .bind(payload)
    .bind(job.max_retries)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
    .context("failed to insert job")?;
    job_from_row(&row)
}

pub async fn fetch_job<'e, E>(executor: E, id: &str) -> Result<Option<GenerationJob>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_jobs(pool: &Pool, filter: &JobFilter) -> Result<Vec<GenerationJob>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = "));
    qb.push_bind(filter.tenant_id.as_str());
    if !filter.statuses.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(job_type) = filter.job_type {
        qb.push(" AND job_type = ").push_bind(job_type.as_str());
    }
    if let Some(course_id) = filter.course_id.as_deref() {
        qb.push(" AND course_id = ").push_bind(course_id);
    }
    if let Some(parent) = filter.parent_job_id.as_deref() {
        qb.push(" AND parent_job_id = ").push_bind(parent);
    }
    if filter.top_level_only {
        qb.push(" AND parent_job_id IS NULL");
    }
    qb.push(" ORDER BY created_at DESC, id ASC");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn list_children<'e, E>(executor: E, parent_id: &str) -> Result<Vec<GenerationJob>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE parent_job_id = ? ORDER BY created_at ASC, id ASC"
    ))
    .bind(parent_id)
    .fetch_all(executor)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Atomically move the oldest due `queued` job to `processing` for `worker_id`.
#[instrument(skip_all)]
pub async fn claim_next_job(
    pool: &Pool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<GenerationJob>> {
    let row = sqlx::query(&format!(
        "UPDATE jobs SET status = 'processing', claimed_by = ?, heartbeat_at = ?, \
         started_at = COALESCE(started_at, ?) \
         WHERE id = (SELECT id FROM jobs WHERE status = 'queued' AND run_at <= ? \
                     ORDER BY run_at ASC, created_at ASC LIMIT 1) \
           AND status = 'queued' \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(worker_id)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Apply a progress report to a `processing` job. Percent never decreases; a
/// regressing report only refreshes the heartbeat. When `worker_id` is given
/// the job must still be claimed by that worker.
///
/// Returns the stored percent, or `None` when nothing matched.
pub async fn update_progress<'e, E>(
    executor: E,
    id: &str,
    worker_id: Option<&str>,
    percent: i32,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<i32>>
where
    E: SqliteExecutor<'e>,
{
    let stored: Option<i32> = sqlx::query_scalar(
        "UPDATE jobs SET \
           progress_message = CASE WHEN ? >= progress_percent \
                                   THEN COALESCE(?, progress_message) \
                                   ELSE progress_message END, \
           progress_percent = MAX(progress_percent, ?), \
           heartbeat_at = ? \
         WHERE id = ? AND status = 'processing' AND (? IS NULL OR claimed_by = ?) \
         RETURNING progress_percent",
    )
    .bind(percent)
    .bind(message)
    .bind(percent)
    .bind(now)
    .bind(id)
    .bind(worker_id)
    .bind(worker_id)
    .fetch_optional(executor)
    .await?;
    Ok(stored)
}

/// Refresh the heartbeat of a `processing` job.
pub async fn touch_job<'e, E>(executor: E, id: &str, now: DateTime<Utc>) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query("UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status = 'processing'")
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_completed<'e, E>(
    executor: E,
    id: &str,
    result: &Value,
    tokens_used: i64,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE jobs SET status = 'completed', progress_percent = 100, result = ?, \
         tokens_used = tokens_used + ?, completed_at = ?, heartbeat_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(serde_json::to_string(result)?)
    .bind(tokens_used)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_failed<'e, E>(
    executor: E,
    id: &str,
    error_message: &str,
    retry_count: Option<i32>,
    tokens_used: i64,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE jobs SET status = 'failed', error_message = ?, \
         retry_count = COALESCE(?, retry_count), tokens_used = tokens_used + ?, \
         completed_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(error_message)
    .bind(retry_count)
    .bind(tokens_used)
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Put a `processing` job back in the queue for another attempt at `run_at`.
pub async fn requeue_for_retry<'e, E>(
    executor: E,
    id: &str,
    retry_count: i32,
    run_at: DateTime<Utc>,
    message: &str,
    tokens_used: i64,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE jobs SET status = 'queued', retry_count = ?, run_at = ?, claimed_by = NULL, \
         progress_message = ?, tokens_used = tokens_used + ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(retry_count)
    .bind(run_at)
    .bind(message)
    .bind(tokens_used)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_cancelled<'e, E>(executor: E, id: &str, now: DateTime<Utc>) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE jobs SET status = 'cancelled', completed_at = ? \
         WHERE id = ? AND status IN ('queued', 'processing')",
    )
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Cancel every non-terminal child of `parent_id`; returns the cancelled ids.
pub async fn cancel_children<'e, E>(
    executor: E,
    parent_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let ids: Vec<String> = sqlx::query_scalar(
        "UPDATE jobs SET status = 'cancelled', completed_at = ? \
         WHERE parent_job_id = ? AND status IN ('queued', 'processing') RETURNING id",
    )
    .bind(now)
    .bind(parent_id)
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

/// `processing` jobs whose last checkpoint is older than `cutoff`. Parents
/// with live children are advanced by their children and are skipped.
#[instrument(skip_all)]
pub async fn list_stale_jobs(pool: &Pool, cutoff: DateTime<Utc>) -> Result<Vec<GenerationJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE status = 'processing' \
           AND COALESCE(heartbeat_at, started_at, created_at) < ? \
           AND NOT EXISTS (SELECT 1 FROM jobs c WHERE c.parent_job_id = jobs.id \
                           AND c.status IN ('queued', 'processing')) \
         ORDER BY created_at ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Non-terminal jobs of `job_type` for a course.
pub async fn count_active_jobs<'e, E>(executor: E, course_id: &str, job_type: JobType) -> Result<i64>
where
    E: SqliteExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE course_id = ? AND job_type = ? \
         AND status IN ('queued', 'processing')",
    )
    .bind(course_id)
    .bind(job_type.as_str())
    .fetch_one(executor)
    .await?;
    Ok(count)
}

pub async fn count_jobs_by_status(pool: &Pool, tenant_id: &str) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM jobs WHERE tenant_id = ? GROUP BY status ORDER BY status",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Outlines
// ---------------------------------------------------------------------------

fn outline_from_row(row: &SqliteRow) -> Result<CourseOutline> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("approval_status")?;
    let approval_status = ApprovalStatus::parse(&status)
        .ok_or_else(|| anyhow!("outline {} has unknown status {}", id, status))?;
    let sections: String = row.try_get("sections")?;
    let sections: Vec<OutlineSection> = serde_json::from_str(&sections)
        .with_context(|| format!("outline {} has invalid sections", id))?;
    Ok(CourseOutline {
        tenant_id: row.try_get("tenant_id")?,
        course_id: row.try_get("course_id")?,
        version: row.try_get("version")?,
        approval_status,
        sections,
        rejection_reason: row.try_get("rejection_reason")?,
        revision_notes: row.try_get("revision_notes")?,
        source_job_id: row.try_get("source_job_id")?,
        superseded_at: row.try_get("superseded_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

/// Insert the next version for a course. Any live `pending_review` or
/// `revision_requested` version is rejected as superseded and a live
/// `approved` version is marked superseded, so at most one version per course
/// is ever awaiting review or approved.
#[instrument(skip_all)]
pub async fn insert_outline_version(
    tx: &mut Tx<'_>,
    outline: &NewOutline,
    now: DateTime<Utc>,
) -> Result<CourseOutline> {
    sqlx::query(
        "UPDATE course_outlines SET approval_status = 'rejected', \
         rejection_reason = COALESCE(rejection_reason, 'superseded by a newer version'), \
         superseded_at = ?, updated_at = ? \
         WHERE course_id = ? AND superseded_at IS NULL \
           AND approval_status IN ('pending_review', 'revision_requested')",
    )
    .bind(now)
    .bind(now)
    .bind(&outline.course_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "UPDATE course_outlines SET superseded_at = ?, updated_at = ? \
         WHERE course_id = ? AND superseded_at IS NULL AND approval_status = 'approved'",
    )
    .bind(now)
    .bind(now)
    .bind(&outline.course_id)
    .execute(&mut **tx)
    .await?;

    let latest: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) FROM course_outlines WHERE course_id = ?",
    )
    .bind(&outline.course_id)
    .fetch_one(&mut **tx)
    .await?;

    let row = sqlx::query(&format!(
        "INSERT INTO course_outlines (id, tenant_id, course_id, version, approval_status, \
         sections, source_job_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending_review', ?, ?, ?, ?) RETURNING {OUTLINE_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&outline.tenant_id)
    .bind(&outline.course_id)
    .bind(latest + 1)
    .bind(serde_json::to_string(&outline.sections)?)
    .bind(outline.source_job_id.as_deref())
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert outline version")?;
    outline_from_row(&row)
}

/// Latest version for a course, or the given `version`.
pub async fn fetch_outline<'e, E>(
    executor: E,
    course_id: &str,
    version: Option<i64>,
) -> Result<Option<CourseOutline>>
where
    E: SqliteExecutor<'e>,
{
    let row = match version {
        Some(version) => {
            sqlx::query(&format!(
                "SELECT {OUTLINE_COLUMNS} FROM course_outlines WHERE course_id = ? AND version = ?"
            ))
            .bind(course_id)
            .bind(version)
            .fetch_optional(executor)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {OUTLINE_COLUMNS} FROM course_outlines WHERE course_id = ? \
                 ORDER BY version DESC LIMIT 1"
            ))
            .bind(course_id)
            .fetch_optional(executor)
            .await?
        }
    };
    row.as_ref().map(outline_from_row).transpose()
}

pub async fn fetch_outline_by_id<'e, E>(executor: E, id: &str) -> Result<Option<CourseOutline>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "SELECT {OUTLINE_COLUMNS} FROM course_outlines WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(outline_from_row).transpose()
}

/// The live approved version, if any.
pub async fn fetch_approved_outline<'e, E>(
    executor: E,
    course_id: &str,
) -> Result<Option<CourseOutline>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "SELECT {OUTLINE_COLUMNS} FROM course_outlines \
         WHERE course_id = ? AND approval_status = 'approved' AND superseded_at IS NULL \
         ORDER BY version DESC LIMIT 1"
    ))
    .bind(course_id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(outline_from_row).transpose()
}

pub async fn list_outline_versions(pool: &Pool, course_id: &str) -> Result<Vec<CourseOutline>> {
    let rows = sqlx::query(&format!(
        "SELECT {OUTLINE_COLUMNS} FROM course_outlines WHERE course_id = ? ORDER BY version ASC"
    ))
    .bind(course_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(outline_from_row).collect()
}

/// Compare-and-set an outline's approval status on a live version.
#[allow(clippy::too_many_arguments)]
pub async fn transition_outline<'e, E>(
    executor: E,
    id: &str,
    course_id: &str,
    from: ApprovalStatus,
    to: ApprovalStatus,
    rejection_reason: Option<&str>,
    revision_notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE course_outlines SET approval_status = ?, \
         rejection_reason = COALESCE(?, rejection_reason), \
         revision_notes = COALESCE(?, revision_notes), updated_at = ? \
         WHERE id = ? AND course_id = ? AND approval_status = ? AND superseded_at IS NULL",
    )
    .bind(to.as_str())
    .bind(rejection_reason)
    .bind(revision_notes)
    .bind(now)
    .bind(id)
    .bind(course_id)
    .bind(from.as_str())
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Bump `updated_at` on the live approved outline; false when there is none.
pub async fn touch_approved_outline<'e, E>(
    executor: E,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE course_outlines SET updated_at = ? \
         WHERE id = ? AND approval_status = 'approved' AND superseded_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Replace sections while the version is still live and in `expected` status.
pub async fn update_outline_sections<'e, E>(
    executor: E,
    id: &str,
    expected: ApprovalStatus,
    sections: &[OutlineSection],
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query(
        "UPDATE course_outlines SET sections = ?, updated_at = ? \
         WHERE id = ? AND approval_status = ? AND superseded_at IS NULL",
    )
    .bind(serde_json::to_string(sections)?)
    .bind(now)
    .bind(id)
    .bind(expected.as_str())
    .execute(executor)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Generated lessons
// ---------------------------------------------------------------------------

fn lesson_from_row(row: &SqliteRow) -> Result<GeneratedLesson> {
    let id: String = row.try_get("id")?;
    let components: String = row.try_get("components")?;
    let components: Vec<LessonComponent> = serde_json::from_str(&components)
        .with_context(|| format!("lesson {} has invalid components", id))?;
    Ok(GeneratedLesson {
        tenant_id: row.try_get("tenant_id")?,
        course_id: row.try_get("course_id")?,
        outline_id: row.try_get("outline_id")?,
        section_id: row.try_get("section_id")?,
        outline_lesson_id: row.try_get("outline_lesson_id")?,
        title: row.try_get("title")?,
        segue_text: row.try_get("segue_text")?,
        components,
        job_id: row.try_get("job_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

/// Insert a lesson, or replace the content of the existing lesson generated
/// for the same outline lesson (its id is kept).
pub async fn upsert_generated_lesson<'e, E>(
    executor: E,
    lesson: &GeneratedLesson,
) -> Result<GeneratedLesson>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO generated_lessons (id, tenant_id, course_id, outline_id, section_id, \
         outline_lesson_id, title, segue_text, components, job_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(outline_id, outline_lesson_id) DO UPDATE SET \
           section_id = excluded.section_id, title = excluded.title, \
           segue_text = excluded.segue_text, components = excluded.components, \
           job_id = excluded.job_id, updated_at = excluded.updated_at \
         RETURNING {LESSON_COLUMNS}"
    ))
    .bind(&lesson.id)
    .bind(&lesson.tenant_id)
    .bind(&lesson.course_id)
    .bind(&lesson.outline_id)
    .bind(&lesson.section_id)
    .bind(&lesson.outline_lesson_id)
    .bind(&lesson.title)
    .bind(&lesson.segue_text)
    .bind(serde_json::to_string(&lesson.components)?)
    .bind(lesson.job_id.as_deref())
    .bind(lesson.created_at)
    .bind(lesson.updated_at)
    .fetch_one(executor)
    .await
    .context("failed to store generated lesson")?;
    lesson_from_row(&row)
}

pub async fn fetch_generated_lesson<'e, E>(
    executor: E,
    id: &str,
) -> Result<Option<GeneratedLesson>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "SELECT {LESSON_COLUMNS} FROM generated_lessons WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(lesson_from_row).transpose()
}

pub async fn list_lessons_for_outline(
    pool: &Pool,
    outline_id: &str,
) -> Result<Vec<GeneratedLesson>> {
    let rows = sqlx::query(&format!(
        "SELECT {LESSON_COLUMNS} FROM generated_lessons WHERE outline_id = ? \
         ORDER BY created_at ASC, id ASC"
    ))
    .bind(outline_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(lesson_from_row).collect()
}

/// Outline lesson ids of `outline_id` that already have generated content.
pub async fn lesson_ids_with_content<'e, E>(executor: E, outline_id: &str) -> Result<Vec<String>>
where
    E: SqliteExecutor<'e>,
{
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT outline_lesson_id FROM generated_lessons WHERE outline_id = ?",
    )
    .bind(outline_id)
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

pub async fn update_lesson_components<'e, E>(
    executor: E,
    id: &str,
    components: &[LessonComponent],
    now: DateTime<Utc>,
) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let res = sqlx::query("UPDATE generated_lessons SET components = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(components)?)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("notification_type")?;
    let notification_type = NotificationType::parse(&kind)
        .ok_or_else(|| anyhow!("notification {} has unknown type {}", id, kind))?;
    let priority: String = row.try_get("priority")?;
    let priority = Priority::parse(&priority)
        .ok_or_else(|| anyhow!("notification {} has unknown priority {}", id, priority))?;
    Ok(Notification {
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        notification_type,
        priority,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        read: row.try_get("read")?,
        read_at: row.try_get("read_at")?,
        course_id: row.try_get("course_id")?,
        job_id: row.try_get("job_id")?,
        task_id: row.try_get("task_id")?,
        sme_id: row.try_get("sme_id")?,
        created_at: row.try_get("created_at")?,
        id,
    })
}

/// Insert a notification unless one with the same dedupe key already exists
/// for the user. Returns `None` for a duplicate.
#[instrument(skip_all)]
pub async fn insert_notification<'e, E>(
    executor: E,
    notification: &NewNotification,
    now: DateTime<Utc>,
) -> Result<Option<Notification>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO notifications (id, tenant_id, user_id, notification_type, priority, title, \
         message, course_id, job_id, task_id, sme_id, dedupe_key, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, dedupe_key) DO NOTHING \
         RETURNING {NOTIFICATION_COLUMNS}"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&notification.tenant_id)
    .bind(&notification.user_id)
    .bind(notification.notification_type.as_str())
    .bind(notification.priority.as_str())
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(notification.course_id.as_deref())
    .bind(notification.job_id.as_deref())
    .bind(notification.task_id.as_deref())
    .bind(notification.sme_id.as_deref())
    .bind(&notification.dedupe_key)
    .bind(now)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(notification_from_row).transpose()
}

pub async fn list_notifications(
    pool: &Pool,
    user_id: &str,
    unread_only: bool,
    limit: i64,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query(&format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
         WHERE user_id = ? AND (? = 0 OR read = 0) \
         ORDER BY created_at DESC, id ASC LIMIT ?"
    ))
    .bind(user_id)
    .bind(unread_only)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(notification_from_row).collect()
}

pub async fn mark_notification_read(
    pool: &Pool,
    user_id: &str,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notifications SET read = 1, read_at = ? WHERE id = ? AND user_id = ? AND read = 0",
    )
    .bind(now)
    .bind(id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn mark_all_notifications_read(
    pool: &Pool,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE notifications SET read = 1, read_at = ? WHERE user_id = ? AND read = 0",
    )
    .bind(now)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn unread_notification_count(pool: &Pool, user_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}
