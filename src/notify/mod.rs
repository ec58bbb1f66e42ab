//! Notification fan-out.
//!
//! `Notifier` turns user-visible job transitions into inbox rows and pushes
//! them, together with job status snapshots, onto the caller's live topic.
//! Inbox writes are keyed by job and notification type so a repeated
//! transition never notifies twice. Delivery is best-effort: a failing write
//! is logged and never fails the job it describes.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, NewNotification, Pool};
use crate::error::Result;
use crate::model::{
    CourseOutline, GenerationJob, JobPayload, JobStatus, JobType, Notification, NotificationType,
    Priority,
};

pub mod bridge;
pub mod hub;

pub use bridge::{event_stream, run_bridge, BridgeExit, EventSink};
pub use hub::{EventType, JobStatusEvent, NotificationHub, Subscription, Unsubscribe, UserEvent};

#[derive(Debug, Clone)]
pub struct Notifier {
    pool: Pool,
    hub: NotificationHub,
}

impl Notifier {
    pub fn new(pool: Pool, hub: NotificationHub) -> Self {
        Self { pool, hub }
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Push a status snapshot of `job` to its owner's live topic.
    pub fn publish_status(&self, job: &GenerationJob) {
        self.hub.publish(&job.user_id, UserEvent::job_status(job));
    }

    /// Record and publish the notification for a terminal job, if it has one.
    #[instrument(skip_all, fields(job_id = %job.id, status = job.status.as_str()))]
    pub async fn on_job_terminal(&self, job: &GenerationJob) {
        self.publish_status(job);
        if let Some(new) = notification_for(job) {
            self.notify(&new).await;
        }
    }

    /// Tell the owner that an outline is back in review.
    pub async fn approval_requested(&self, user_id: &str, outline: &CourseOutline) {
        let new = NewNotification {
            tenant_id: outline.tenant_id.clone(),
            user_id: user_id.to_string(),
            notification_type: NotificationType::ApprovalRequested,
            priority: Priority::Normal,
            title: "Outline awaiting approval".into(),
            message: format!(
                "Version {} of the course outline is ready for review.",
                outline.version
            ),
            course_id: Some(outline.course_id.clone()),
            job_id: outline.source_job_id.clone(),
            task_id: None,
            sme_id: None,
            dedupe_key: format!(
                "{}:{}:{}",
                outline.id,
                NotificationType::ApprovalRequested.as_str(),
                outline.updated_at.timestamp_millis()
            ),
        };
        self.notify(&new).await;
    }

    /// Insert `new` once and push it live. Returns the stored row, or `None`
    /// for a duplicate or a failed write.
    pub async fn notify(&self, new: &NewNotification) -> Option<Notification> {
        match db::insert_notification(&self.pool, new, Utc::now()).await {
            Ok(Some(notification)) => {
                info!(
                    user_id = %notification.user_id,
                    kind = notification.notification_type.as_str(),
                    "notification created"
                );
                self.hub
                    .publish(&notification.user_id, UserEvent::notification(notification.clone()));
                Some(notification)
            }
            Ok(None) => {
                debug!(dedupe_key = %new.dedupe_key, "duplicate notification suppressed");
                None
            }
            Err(err) => {
                warn!(dedupe_key = %new.dedupe_key, "failed to record notification: {err:#}");
                None
            }
        }
    }

    pub async fn list(&self, user_id: &str, unread_only: bool, limit: i64) -> Result<Vec<Notification>> {
        Ok(db::list_notifications(&self.pool, user_id, unread_only, limit.clamp(1, 500)).await?)
    }

    pub async fn mark_read(&self, user_id: &str, notification_id: &str) -> Result<bool> {
        Ok(db::mark_notification_read(&self.pool, user_id, notification_id, Utc::now()).await?)
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        Ok(db::mark_all_notifications_read(&self.pool, user_id, Utc::now()).await?)
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64> {
        Ok(db::unread_notification_count(&self.pool, user_id).await?)
    }
}

/// The inbox entry a terminal job produces. Child lesson jobs report through
/// their parent, and cancellations are user-initiated, so neither notifies.
pub fn notification_for(job: &GenerationJob) -> Option<NewNotification> {
    if job.parent_job_id.is_some() {
        return None;
    }
    let failed = match job.status {
        JobStatus::Completed => false,
        JobStatus::Failed => true,
        _ => return None,
    };
    let error = job.error_message.as_deref().unwrap_or("unknown error");

    let (notification_type, title, message) = match (job.job_type, failed) {
        (JobType::SmeIngestion, false) => (
            NotificationType::IngestionComplete,
            "Knowledge source ready".to_string(),
            "Your source material has been processed.".to_string(),
        ),
        (JobType::SmeIngestion, true) => (
            NotificationType::IngestionFailed,
            "Knowledge source failed".to_string(),
            format!("Processing your source material failed: {error}"),
        ),
        (JobType::CourseOutline, false) => (
            NotificationType::OutlineReady,
            "Course outline ready".to_string(),
            "A new course outline is ready for your review.".to_string(),
        ),
        (JobType::FullCourse, false) => (
            NotificationType::GenerationComplete,
            "Course content ready".to_string(),
            "All lessons for your course have been generated.".to_string(),
        ),
        (JobType::ComponentRegen | JobType::LessonContent, false) => (
            NotificationType::GenerationComplete,
            "Lesson updated".to_string(),
            "Your regenerated content is ready.".to_string(),
        ),
        (_, true) => (
            NotificationType::GenerationFailed,
            "Generation failed".to_string(),
            format!("Content generation failed: {error}"),
        ),
    };

    let priority = match (failed, job.job_type) {
        (true, _) => Priority::High,
        (false, JobType::ComponentRegen) => Priority::Low,
        (false, _) => Priority::Normal,
    };
    let sme_id = match &job.payload {
        JobPayload::SmeIngestion(p) => Some(p.sme_id.clone()),
        _ => None,
    };

    Some(NewNotification {
        tenant_id: job.tenant_id.clone(),
        user_id: job.user_id.clone(),
        notification_type,
        priority,
        title,
        message,
        course_id: job.course_id.clone(),
        job_id: Some(job.id.clone()),
        task_id: None,
        sme_id,
        dedupe_key: format!("{}:{}", job.id, notification_type.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FullCoursePayload, LessonPayload};
    use chrono::Utc;

    fn job(payload: JobPayload, status: JobStatus) -> GenerationJob {
        let now = Utc::now();
        GenerationJob {
            id: "job-1".into(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            parent_job_id: None,
            course_id: payload.course_id().map(str::to_string),
            job_type: payload.job_type(),
            status,
            payload,
            result: None,
            progress_percent: 0,
            progress_message: None,
            retry_count: 0,
            max_retries: 3,
            error_message: Some("boom".into()),
            tokens_used: 0,
            run_at: now,
            claimed_by: None,
            heartbeat_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn full_course() -> JobPayload {
        JobPayload::FullCourse(FullCoursePayload {
            course_id: "c1".into(),
            outline_id: "o1".into(),
        })
    }

    #[test]
    fn failures_are_high_priority_and_keyed_by_job() {
        let n = notification_for(&job(full_course(), JobStatus::Failed)).unwrap();
        assert_eq!(n.notification_type, NotificationType::GenerationFailed);
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.dedupe_key, "job-1:generation_failed");
        assert!(n.message.contains("boom"));
    }

    #[test]
    fn children_and_cancellations_are_silent() {
        let mut child = job(
            JobPayload::LessonContent(LessonPayload {
                course_id: "c1".into(),
                outline_id: "o1".into(),
                section_id: "s1".into(),
                lesson_id: "l1".into(),
            }),
            JobStatus::Completed,
        );
        child.parent_job_id = Some("parent".into());
        assert!(notification_for(&child).is_none());
        assert!(notification_for(&job(full_course(), JobStatus::Cancelled)).is_none());
        assert!(notification_for(&job(full_course(), JobStatus::Processing)).is_none());
    }
}
