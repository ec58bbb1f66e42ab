//! Insert and query models used by repositories.
//!
//! Keep these structs focused on the data passed to or returned by queries.
//! Business logic should live in higher layers.

use crate::model::{
    JobPayload, JobStatus, JobType, NotificationType, OutlineSection, Priority,
};

/// A job about to be inserted in `queued` state.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: String,
    pub user_id: String,
    pub parent_job_id: Option<String>,
    pub payload: JobPayload,
    pub max_retries: i32,
}

/// Tenant-scoped job listing filter.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: String,
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<JobType>,
    pub course_id: Option<String>,
    pub parent_job_id: Option<String>,
    /// Only jobs without a parent (hides `lesson_content` children).
    pub top_level_only: bool,
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOutline {
    pub tenant_id: String,
    pub course_id: String,
    pub sections: Vec<OutlineSection>,
    pub source_job_id: Option<String>,
}

/// Notification insert; `dedupe_key` is unique per user.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub tenant_id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub course_id: Option<String>,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub sme_id: Option<String>,
    pub dedupe_key: String,
}
