//! Tenant-scoped operations exposed to callers.
//!
//! Everything a caller can reach goes through `Pipeline` with a
//! `TenantScope`. Records that belong to another tenant are reported as
//! `NotFound` rather than forbidden.

use chrono::Utc;
use futures::Stream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::approval::ApprovalGate;
use crate::config::Config;
use crate::db::{self, JobFilter, Pool};
use crate::error::{PipelineError, Result};
use crate::identity::TenantScope;
use crate::model::{
    ComponentRegenPayload, CourseOutline, FullCoursePayload, GeneratedLesson, GenerationJob,
    JobPayload, JobType, Notification, OutlinePayload, OutlineSection,
};
use crate::notify::bridge::DEFAULT_HEARTBEAT;
use crate::notify::{
    event_stream, NotificationHub, Notifier, Subscription, Unsubscribe, UserEvent,
};
use crate::orchestrator::{Orchestrator, TransitionOutcome};

#[derive(Debug, Clone)]
pub struct Pipeline {
    orchestrator: Orchestrator,
    gate: ApprovalGate,
    heartbeat: Duration,
}

impl Pipeline {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let gate = ApprovalGate::new(orchestrator.clone());
        Self {
            orchestrator,
            gate,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Wire a pipeline over `pool` using the job and notification settings.
    pub fn from_config(pool: Pool, cfg: &Config) -> Self {
        let hub = NotificationHub::new(cfg.notifications.buffer);
        let notifier = Notifier::new(pool.clone(), hub);
        let mut pipeline = Self::new(Orchestrator::from_config(pool, notifier, cfg));
        pipeline.heartbeat = cfg.notifications.heartbeat();
        pipeline
    }

    /// Keepalive interval for live event streams.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn approval(&self) -> &ApprovalGate {
        &self.gate
    }

    fn pool(&self) -> &Pool {
        self.orchestrator.pool()
    }

    // -- jobs ---------------------------------------------------------------

    pub async fn submit(&self, scope: &TenantScope, payload: JobPayload) -> Result<GenerationJob> {
        self.orchestrator
            .submit(&scope.tenant_id, &scope.user_id, payload)
            .await
    }

    pub async fn get_job(&self, scope: &TenantScope, job_id: &str) -> Result<GenerationJob> {
        let job = self.orchestrator.get_job(job_id).await?;
        if job.tenant_id != scope.tenant_id {
            return Err(PipelineError::not_found(format!("job {job_id}")));
        }
        Ok(job)
    }

    /// List jobs; the filter's tenant is always replaced by the caller's.
    pub async fn list_jobs(&self, scope: &TenantScope, filter: JobFilter) -> Result<Vec<GenerationJob>> {
        let filter = JobFilter {
            tenant_id: scope.tenant_id.clone(),
            ..filter
        };
        self.orchestrator.list_jobs(&filter).await
    }

    pub async fn cancel(&self, scope: &TenantScope, job_id: &str) -> Result<TransitionOutcome> {
        self.get_job(scope, job_id).await?;
        self.orchestrator.cancel(job_id).await
    }

    // -- outlines -----------------------------------------------------------

    pub async fn generate_outline(
        &self,
        scope: &TenantScope,
        input: OutlinePayload,
    ) -> Result<GenerationJob> {
        if let Some(existing) = db::fetch_outline(self.pool(), &input.course_id, None).await? {
            if existing.tenant_id != scope.tenant_id {
                return Err(PipelineError::not_found(format!("course {}", input.course_id)));
            }
        }
        self.submit(scope, JobPayload::CourseOutline(input)).await
    }

    /// Latest outline of a course, or a specific version.
    pub async fn get_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
        version: Option<i64>,
    ) -> Result<CourseOutline> {
        match db::fetch_outline(self.pool(), course_id, version).await? {
            Some(outline) if outline.tenant_id == scope.tenant_id => Ok(outline),
            _ => Err(PipelineError::not_found(match version {
                Some(v) => format!("outline version {v} of course {course_id}"),
                None => format!("outline of course {course_id}"),
            })),
        }
    }

    pub async fn list_outline_versions(
        &self,
        scope: &TenantScope,
        course_id: &str,
    ) -> Result<Vec<CourseOutline>> {
        let versions = db::list_outline_versions(self.pool(), course_id).await?;
        Ok(versions
            .into_iter()
            .filter(|o| o.tenant_id == scope.tenant_id)
            .collect())
    }

    pub async fn approve_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
        outline_id: &str,
    ) -> Result<(CourseOutline, GenerationJob)> {
        self.gate
            .approve(&scope.tenant_id, &scope.user_id, course_id, outline_id)
            .await
    }

    pub async fn reject_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
        outline_id: &str,
        reason: &str,
    ) -> Result<(CourseOutline, GenerationJob)> {
        self.gate
            .reject(&scope.tenant_id, &scope.user_id, course_id, outline_id, reason)
            .await
    }

    pub async fn request_revision(
        &self,
        scope: &TenantScope,
        course_id: &str,
        outline_id: &str,
        notes: &str,
    ) -> Result<CourseOutline> {
        self.gate
            .request_revision(&scope.tenant_id, course_id, outline_id, notes)
            .await
    }

    pub async fn resubmit_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
        outline_id: &str,
    ) -> Result<CourseOutline> {
        self.gate
            .resubmit(&scope.tenant_id, &scope.user_id, course_id, outline_id)
            .await
    }

    pub async fn update_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
        outline_id: &str,
        sections: Vec<OutlineSection>,
    ) -> Result<CourseOutline> {
        self.gate
            .update(&scope.tenant_id, course_id, outline_id, sections)
            .await
    }

    // -- lessons ------------------------------------------------------------

    /// Submit a `full_course` job for the course's approved outline. Fails
    /// with `Precondition` without an approved outline or while another
    /// `full_course` job for the course is still running.
    #[instrument(skip_all, fields(course_id = %course_id))]
    pub async fn generate_all_lessons(
        &self,
        scope: &TenantScope,
        course_id: &str,
    ) -> Result<GenerationJob> {
        let outline = self.approved_outline(scope, course_id).await?.ok_or_else(|| {
            PipelineError::precondition(format!("course {course_id} has no approved outline"))
        })?;

        let mut tx = self.pool().begin().await?;
        if !db::touch_approved_outline(&mut *tx, &outline.id, Utc::now()).await? {
            tx.rollback().await?;
            return Err(PipelineError::precondition(format!(
                "outline {} is no longer approved",
                outline.id
            )));
        }
        if db::count_active_jobs(&mut *tx, course_id, JobType::FullCourse).await? > 0 {
            tx.rollback().await?;
            return Err(PipelineError::precondition(format!(
                "lesson generation for course {course_id} is already running"
            )));
        }
        let payload = JobPayload::FullCourse(FullCoursePayload {
            course_id: course_id.to_string(),
            outline_id: outline.id.clone(),
        });
        let job = self
            .orchestrator
            .submit_in(&mut tx, &scope.tenant_id, &scope.user_id, payload)
            .await?;
        tx.commit().await?;
        self.orchestrator.announce(&job);
        Ok(job)
    }

    async fn approved_outline(
        &self,
        scope: &TenantScope,
        course_id: &str,
    ) -> Result<Option<CourseOutline>> {
        Ok(db::fetch_approved_outline(self.pool(), course_id)
            .await?
            .filter(|o| o.tenant_id == scope.tenant_id))
    }

    /// Lessons generated for the course's approved outline, in creation order.
    pub async fn list_generated_lessons(
        &self,
        scope: &TenantScope,
        course_id: &str,
    ) -> Result<Vec<GeneratedLesson>> {
        match self.approved_outline(scope, course_id).await? {
            Some(outline) => Ok(db::list_lessons_for_outline(self.pool(), &outline.id).await?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn regenerate_component(
        &self,
        scope: &TenantScope,
        lesson_id: &str,
        component_id: &str,
        prompt: &str,
    ) -> Result<GenerationJob> {
        let lesson = match db::fetch_generated_lesson(self.pool(), lesson_id).await? {
            Some(lesson) if lesson.tenant_id == scope.tenant_id => lesson,
            _ => return Err(PipelineError::not_found(format!("lesson {lesson_id}"))),
        };
        if !lesson.components.iter().any(|c| c.id == component_id) {
            return Err(PipelineError::not_found(format!(
                "component {component_id} of lesson {lesson_id}"
            )));
        }
        self.submit(
            scope,
            JobPayload::ComponentRegen(ComponentRegenPayload {
                course_id: lesson.course_id,
                lesson_id: lesson_id.to_string(),
                component_id: component_id.to_string(),
                prompt: prompt.to_string(),
            }),
        )
        .await
    }

    // -- notifications ------------------------------------------------------

    pub async fn list_notifications(
        &self,
        scope: &TenantScope,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        self.orchestrator
            .notifier()
            .list(&scope.user_id, unread_only, limit)
            .await
    }

    pub async fn mark_notification_read(&self, scope: &TenantScope, id: &str) -> Result<bool> {
        self.orchestrator
            .notifier()
            .mark_read(&scope.user_id, id)
            .await
    }

    pub async fn mark_all_notifications_read(&self, scope: &TenantScope) -> Result<u64> {
        self.orchestrator
            .notifier()
            .mark_all_read(&scope.user_id)
            .await
    }

    pub async fn unread_count(&self, scope: &TenantScope) -> Result<i64> {
        self.orchestrator
            .notifier()
            .unread_count(&scope.user_id)
            .await
    }

    /// Live per-user event stream. Cancel the returned handle on disconnect.
    pub fn subscribe_user_events(&self, scope: &TenantScope) -> (Subscription, Unsubscribe) {
        self.orchestrator
            .notifier()
            .hub()
            .subscribe_user_events(&scope.user_id)
    }

    /// Live events for a connected client, with keepalives at the configured
    /// heartbeat. Ends when `client` is cancelled or the topic closes.
    pub fn event_stream(
        &self,
        scope: &TenantScope,
        client: CancellationToken,
    ) -> impl Stream<Item = UserEvent> + Send {
        let (sub, _unsub) = self.subscribe_user_events(scope);
        event_stream(sub, self.heartbeat, client)
    }
}
