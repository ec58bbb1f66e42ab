use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SmeIngestion,
    CourseOutline,
    LessonContent,
    ComponentRegen,
    FullCourse,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SmeIngestion => "sme_ingestion",
            JobType::CourseOutline => "course_outline",
            JobType::LessonContent => "lesson_content",
            JobType::ComponentRegen => "component_regen",
            JobType::FullCourse => "full_course",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sme_ingestion" => Some(JobType::SmeIngestion),
            "course_outline" => Some(JobType::CourseOutline),
            "lesson_content" => Some(JobType::LessonContent),
            "component_regen" => Some(JobType::ComponentRegen),
            "full_course" => Some(JobType::FullCourse),
            _ => None,
        }
    }
}

/// Job state machine:
///
/// ```text
/// queued -> processing -> completed | failed
///    \          \
///     +----------+------> cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmeIngestionPayload {
    pub sme_id: String,
    pub source_uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutlinePayload {
    pub course_id: String,
    pub knowledge_source_ids: Vec<String>,
    pub target_audiences: Vec<String>,
    pub desired_outcomes: String,
    #[serde(default)]
    pub lesson_count_hint: Option<u32>,
    /// Reviewer feedback from a rejected version, fed back into regeneration.
    #[serde(default)]
    pub guidance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LessonPayload {
    pub course_id: String,
    pub outline_id: String,
    pub section_id: String,
    pub lesson_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentRegenPayload {
    pub course_id: String,
    pub lesson_id: String,
    pub component_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FullCoursePayload {
    pub course_id: String,
    pub outline_id: String,
}

/// Typed payload; the variant decides the job type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    SmeIngestion(SmeIngestionPayload),
    CourseOutline(OutlinePayload),
    LessonContent(LessonPayload),
    ComponentRegen(ComponentRegenPayload),
    FullCourse(FullCoursePayload),
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PipelineError::validation(format!("{field} must be non-empty")));
    }
    Ok(())
}

fn require_list(values: &[String], field: &str) -> Result<()> {
    if values.iter().all(|v| v.trim().is_empty()) {
        return Err(PipelineError::validation(format!(
            "{field} requires at least one entry"
        )));
    }
    Ok(())
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::SmeIngestion(_) => JobType::SmeIngestion,
            JobPayload::CourseOutline(_) => JobType::CourseOutline,
            JobPayload::LessonContent(_) => JobType::LessonContent,
            JobPayload::ComponentRegen(_) => JobType::ComponentRegen,
            JobPayload::FullCourse(_) => JobType::FullCourse,
        }
    }

    pub fn course_id(&self) -> Option<&str> {
        match self {
            JobPayload::SmeIngestion(_) => None,
            JobPayload::CourseOutline(p) => Some(&p.course_id),
            JobPayload::LessonContent(p) => Some(&p.course_id),
            JobPayload::ComponentRegen(p) => Some(&p.course_id),
            JobPayload::FullCourse(p) => Some(&p.course_id),
        }
    }

    /// Type-specific required fields.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::SmeIngestion(p) => {
                require(&p.sme_id, "sme_id")?;
                require_list(&p.source_uris, "source_uris")
            }
            JobPayload::CourseOutline(p) => {
                require(&p.course_id, "course_id")?;
                require_list(&p.knowledge_source_ids, "knowledge_source_ids")?;
                require_list(&p.target_audiences, "target_audiences")?;
                require(&p.desired_outcomes, "desired_outcomes")?;
                if p.lesson_count_hint == Some(0) {
                    return Err(PipelineError::validation(
                        "lesson_count_hint must be > 0 when set",
                    ));
                }
                Ok(())
            }
            JobPayload::LessonContent(p) => {
                require(&p.course_id, "course_id")?;
                require(&p.outline_id, "outline_id")?;
                require(&p.section_id, "section_id")?;
                require(&p.lesson_id, "lesson_id")
            }
            JobPayload::ComponentRegen(p) => {
                require(&p.course_id, "course_id")?;
                require(&p.lesson_id, "lesson_id")?;
                require(&p.component_id, "component_id")?;
                require(&p.prompt, "prompt")
            }
            JobPayload::FullCourse(p) => {
                require(&p.course_id, "course_id")?;
                require(&p.outline_id, "outline_id")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationJob {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub parent_job_id: Option<String>,
    pub course_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub result: Option<Value>,
    pub progress_percent: i32,
    pub progress_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub tokens_used: i64,
    pub run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingReview,
    Approved,
    Rejected,
    RevisionRequested,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::PendingReview => "pending_review",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::RevisionRequested => "revision_requested",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_review" => Some(ApprovalStatus::PendingReview),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "revision_requested" => Some(ApprovalStatus::RevisionRequested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutlineLesson {
    pub id: String,
    pub title: String,
    pub description: String,
    pub estimated_duration_minutes: u32,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutlineSection {
    pub id: String,
    pub title: String,
    pub description: String,
    pub lessons: Vec<OutlineLesson>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseOutline {
    pub id: String,
    pub tenant_id: String,
    pub course_id: String,
    pub version: i64,
    pub approval_status: ApprovalStatus,
    pub sections: Vec<OutlineSection>,
    pub rejection_reason: Option<String>,
    pub revision_notes: Option<String>,
    /// The `course_outline` job that produced this version.
    pub source_job_id: Option<String>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CourseOutline {
    pub fn lessons(&self) -> impl Iterator<Item = (&OutlineSection, &OutlineLesson)> {
        self.sections
            .iter()
            .flat_map(|s| s.lessons.iter().map(move |l| (s, l)))
    }

    pub fn lesson_count(&self) -> usize {
        self.sections.iter().map(|s| s.lessons.len()).sum()
    }

    pub fn find_lesson(&self, lesson_id: &str) -> Option<(&OutlineSection, &OutlineLesson)> {
        self.lessons().find(|(_, l)| l.id == lesson_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Text,
    Heading,
    Image,
    Quiz,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alignment {
    #[serde(default)]
    pub personas: Vec<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub kpis: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LessonComponent {
    pub id: String,
    pub component_type: ComponentType,
    pub order: u32,
    pub content_json: Value,
    #[serde(default)]
    pub alignment: Option<Alignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedLesson {
    pub id: String,
    pub tenant_id: String,
    pub course_id: String,
    pub outline_id: String,
    pub section_id: String,
    /// The `OutlineLesson` this content was generated for.
    pub outline_lesson_id: String,
    pub title: String,
    pub segue_text: String,
    pub components: Vec<LessonComponent>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    IngestionComplete,
    IngestionFailed,
    OutlineReady,
    GenerationComplete,
    GenerationFailed,
    ApprovalRequested,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::IngestionComplete => "ingestion_complete",
            NotificationType::IngestionFailed => "ingestion_failed",
            NotificationType::OutlineReady => "outline_ready",
            NotificationType::GenerationComplete => "generation_complete",
            NotificationType::GenerationFailed => "generation_failed",
            NotificationType::ApprovalRequested => "approval_requested",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingestion_complete" => Some(NotificationType::IngestionComplete),
            "ingestion_failed" => Some(NotificationType::IngestionFailed),
            "outline_ready" => Some(NotificationType::OutlineReady),
            "generation_complete" => Some(NotificationType::GenerationComplete),
            "generation_failed" => Some(NotificationType::GenerationFailed),
            "approval_requested" => Some(NotificationType::ApprovalRequested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub course_id: Option<String>,
    pub job_id: Option<String>,
    pub task_id: Option<String>,
    pub sme_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline_payload() -> OutlinePayload {
        OutlinePayload {
            course_id: "course-1".into(),
            knowledge_source_ids: vec!["src-1".into(), "src-2".into()],
            target_audiences: vec!["new hires".into()],
            desired_outcomes: "ship safely".into(),
            lesson_count_hint: None,
            guidance: None,
        }
    }

    #[test]
    fn outline_payload_requires_sources_and_audience() {
        assert!(JobPayload::CourseOutline(outline_payload()).validate().is_ok());

        let mut p = outline_payload();
        p.knowledge_source_ids.clear();
        let err = JobPayload::CourseOutline(p).validate().unwrap_err();
        assert!(err.to_string().contains("knowledge_source_ids"));

        let mut p = outline_payload();
        p.target_audiences = vec!["  ".into()];
        let err = JobPayload::CourseOutline(p).validate().unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = JobPayload::FullCourse(FullCoursePayload {
            course_id: "c".into(),
            outline_id: "o".into(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "full_course");
        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_type(), JobType::FullCourse);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!(JobStatus::parse("cancelled"), Some(JobStatus::Cancelled));
        assert_eq!(JobType::parse("lesson_content"), Some(JobType::LessonContent));
    }
}
