//! Outline review state machine.
//!
//! ```text
//! pending_review -> approved            approve (submits the full_course job)
//! pending_review -> rejected            reject (submits a course_outline job)
//! pending_review -> revision_requested  request_revision
//! revision_requested -> pending_review  resubmit
//! rejected -> pending_review            new version from regeneration
//! ```
//!
//! Every transition is a compare-and-set on the live version, so only one of
//! two racing reviewers wins and the other gets `Precondition`.

use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db;
use crate::error::{PipelineError, Result};
use crate::model::{
    ApprovalStatus, CourseOutline, FullCoursePayload, GenerationJob, JobPayload, OutlineSection,
};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct ApprovalGate {
    orchestrator: Orchestrator,
}

impl ApprovalGate {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Outline `outline_id` of `course_id`, visible to `tenant_id` only.
    pub async fn outline(
        &self,
        tenant_id: &str,
        course_id: &str,
        outline_id: &str,
    ) -> Result<CourseOutline> {
        match db::fetch_outline_by_id(self.orchestrator.pool(), outline_id).await? {
            Some(o) if o.tenant_id == tenant_id && o.course_id == course_id => Ok(o),
            _ => Err(PipelineError::not_found(format!(
                "outline {outline_id} of course {course_id}"
            ))),
        }
    }

    async fn guard_error(&self, outline_id: &str, expected: ApprovalStatus) -> PipelineError {
        match db::fetch_outline_by_id(self.orchestrator.pool(), outline_id).await {
            Ok(Some(o)) if o.superseded_at.is_some() => PipelineError::precondition(format!(
                "outline {outline_id} was superseded by a newer version"
            )),
            Ok(Some(o)) => PipelineError::precondition(format!(
                "outline {outline_id} is {}, expected {}",
                o.approval_status.as_str(),
                expected.as_str()
            )),
            Ok(None) => PipelineError::not_found(format!("outline {outline_id}")),
            Err(err) => PipelineError::Store(err),
        }
    }

    /// Approve a `pending_review` outline and submit its `full_course` job in
    /// the same transaction.
    #[instrument(skip_all, fields(outline_id = %outline_id))]
    pub async fn approve(
        &self,
        tenant_id: &str,
        user_id: &str,
        course_id: &str,
        outline_id: &str,
    ) -> Result<(CourseOutline, GenerationJob)> {
        self.outline(tenant_id, course_id, outline_id).await?;

        let now = Utc::now();
        let mut tx = self.orchestrator.pool().begin().await?;
        let applied = db::transition_outline(
            &mut *tx,
            outline_id,
            course_id,
            ApprovalStatus::PendingReview,
            ApprovalStatus::Approved,
            None,
            None,
            now,
        )
        .await?;
        if !applied {
            tx.rollback().await?;
            return Err(self.guard_error(outline_id, ApprovalStatus::PendingReview).await);
        }
        let payload = JobPayload::FullCourse(FullCoursePayload {
            course_id: course_id.to_string(),
            outline_id: outline_id.to_string(),
        });
        let job = self
            .orchestrator
            .submit_in(&mut tx, tenant_id, user_id, payload)
            .await?;
        tx.commit().await?;

        info!(job_id = %job.id, "outline approved");
        self.orchestrator.announce(&job);
        let outline = self.outline(tenant_id, course_id, outline_id).await?;
        Ok((outline, job))
    }

    /// Reject with a mandatory reason and submit a regeneration job that
    /// carries the reason as guidance.
    #[instrument(skip_all, fields(outline_id = %outline_id))]
    pub async fn reject(
        &self,
        tenant_id: &str,
        user_id: &str,
        course_id: &str,
        outline_id: &str,
        reason: &str,
    ) -> Result<(CourseOutline, GenerationJob)> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(PipelineError::validation("rejection reason must be non-empty"));
        }
        let outline = self.outline(tenant_id, course_id, outline_id).await?;
        let mut request = self.regeneration_request(&outline).await?;
        request.guidance = Some(reason.to_string());

        let now = Utc::now();
        let mut tx = self.orchestrator.pool().begin().await?;
        let applied = db::transition_outline(
            &mut *tx,
            outline_id,
            course_id,
            ApprovalStatus::PendingReview,
            ApprovalStatus::Rejected,
            Some(reason),
            None,
            now,
        )
        .await?;
        if !applied {
            tx.rollback().await?;
            return Err(self.guard_error(outline_id, ApprovalStatus::PendingReview).await);
        }
        let job = self
            .orchestrator
            .submit_in(&mut tx, tenant_id, user_id, JobPayload::CourseOutline(request))
            .await?;
        tx.commit().await?;

        info!(job_id = %job.id, "outline rejected, regeneration queued");
        self.orchestrator.announce(&job);
        let outline = self.outline(tenant_id, course_id, outline_id).await?;
        Ok((outline, job))
    }

    /// The request that produced `outline`, reused for regeneration.
    async fn regeneration_request(
        &self,
        outline: &CourseOutline,
    ) -> Result<crate::model::OutlinePayload> {
        let source = match outline.source_job_id.as_deref() {
            Some(id) => db::fetch_job(self.orchestrator.pool(), id).await?,
            None => None,
        };
        match source.map(|job| job.payload) {
            Some(JobPayload::CourseOutline(request)) => Ok(request),
            _ => Err(PipelineError::precondition(format!(
                "outline {} has no source request to regenerate from",
                outline.id
            ))),
        }
    }

    pub async fn request_revision(
        &self,
        tenant_id: &str,
        course_id: &str,
        outline_id: &str,
        notes: &str,
    ) -> Result<CourseOutline> {
        let notes = notes.trim();
        if notes.is_empty() {
            return Err(PipelineError::validation("revision notes must be non-empty"));
        }
        self.outline(tenant_id, course_id, outline_id).await?;
        let applied = db::transition_outline(
            self.orchestrator.pool(),
            outline_id,
            course_id,
            ApprovalStatus::PendingReview,
            ApprovalStatus::RevisionRequested,
            None,
            Some(notes),
            Utc::now(),
        )
        .await?;
        if !applied {
            return Err(self.guard_error(outline_id, ApprovalStatus::PendingReview).await);
        }
        info!(outline_id, "revision requested");
        self.outline(tenant_id, course_id, outline_id).await
    }

    /// Return a revised outline to review.
    pub async fn resubmit(
        &self,
        tenant_id: &str,
        user_id: &str,
        course_id: &str,
        outline_id: &str,
    ) -> Result<CourseOutline> {
        self.outline(tenant_id, course_id, outline_id).await?;
        let applied = db::transition_outline(
            self.orchestrator.pool(),
            outline_id,
            course_id,
            ApprovalStatus::RevisionRequested,
            ApprovalStatus::PendingReview,
            None,
            None,
            Utc::now(),
        )
        .await?;
        if !applied {
            return Err(self
                .guard_error(outline_id, ApprovalStatus::RevisionRequested)
                .await);
        }
        let outline = self.outline(tenant_id, course_id, outline_id).await?;
        self.orchestrator
            .notifier()
            .approval_requested(user_id, &outline)
            .await;
        Ok(outline)
    }

    /// Edit sections in place without changing approval status.
    ///
    /// Sections and lessons are matched by id; an empty id marks a new entry
    /// and gets a fresh one. Unknown ids are rejected, and so is dropping a
    /// lesson that already has generated content.
    #[instrument(skip_all, fields(outline_id = %outline_id))]
    pub async fn update(
        &self,
        tenant_id: &str,
        course_id: &str,
        outline_id: &str,
        sections: Vec<OutlineSection>,
    ) -> Result<CourseOutline> {
        let outline = self.outline(tenant_id, course_id, outline_id).await?;
        if outline.superseded_at.is_some() || outline.approval_status == ApprovalStatus::Rejected {
            return Err(PipelineError::precondition(format!(
                "outline {outline_id} is no longer editable"
            )));
        }
        let sections = normalize_sections(&outline, sections)?;

        let with_content = db::lesson_ids_with_content(self.orchestrator.pool(), outline_id).await?;
        let kept: HashSet<&str> = sections
            .iter()
            .flat_map(|s| s.lessons.iter().map(|l| l.id.as_str()))
            .collect();
        if let Some(orphan) = with_content.iter().find(|id| !kept.contains(id.as_str())) {
            return Err(PipelineError::precondition(format!(
                "lesson {orphan} has generated content and cannot be removed"
            )));
        }

        let applied = db::update_outline_sections(
            self.orchestrator.pool(),
            outline_id,
            outline.approval_status,
            &sections,
            Utc::now(),
        )
        .await?;
        if !applied {
            return Err(self.guard_error(outline_id, outline.approval_status).await);
        }
        self.outline(tenant_id, course_id, outline_id).await
    }
}

fn normalize_sections(
    outline: &CourseOutline,
    mut sections: Vec<OutlineSection>,
) -> Result<Vec<OutlineSection>> {
    let known_sections: HashSet<&str> = outline.sections.iter().map(|s| s.id.as_str()).collect();
    let known_lessons: HashSet<&str> = outline.lessons().map(|(_, l)| l.id.as_str()).collect();
    let mut seen = HashSet::new();

    for section in sections.iter_mut() {
        if section.title.trim().is_empty() {
            return Err(PipelineError::validation("section title must be non-empty"));
        }
        if section.id.is_empty() {
            section.id = Uuid::new_v4().to_string();
        } else if !known_sections.contains(section.id.as_str()) {
            return Err(PipelineError::validation(format!(
                "unknown section id {}",
                section.id
            )));
        }
        if !seen.insert(section.id.clone()) {
            return Err(PipelineError::validation(format!(
                "duplicate id {}",
                section.id
            )));
        }
        for lesson in section.lessons.iter_mut() {
            if lesson.title.trim().is_empty() {
                return Err(PipelineError::validation("lesson title must be non-empty"));
            }
            if lesson.id.is_empty() {
                lesson.id = Uuid::new_v4().to_string();
            } else if !known_lessons.contains(lesson.id.as_str()) {
                return Err(PipelineError::validation(format!(
                    "unknown lesson id {}",
                    lesson.id
                )));
            }
            if !seen.insert(lesson.id.clone()) {
                return Err(PipelineError::validation(format!(
                    "duplicate id {}",
                    lesson.id
                )));
            }
        }
    }
    if sections.iter().all(|s| s.lessons.is_empty()) {
        return Err(PipelineError::validation("outline needs at least one lesson"));
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutlineLesson;

    fn outline() -> CourseOutline {
        let now = Utc::now();
        CourseOutline {
            id: "o1".into(),
            tenant_id: "t1".into(),
            course_id: "c1".into(),
            version: 1,
            approval_status: ApprovalStatus::PendingReview,
            sections: vec![OutlineSection {
                id: "s1".into(),
                title: "Basics".into(),
                description: String::new(),
                lessons: vec![OutlineLesson {
                    id: "l1".into(),
                    title: "Intro".into(),
                    description: String::new(),
                    estimated_duration_minutes: 10,
                    learning_objectives: vec![],
                }],
            }],
            rejection_reason: None,
            revision_notes: None,
            source_job_id: None,
            superseded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn new_entries_get_ids_and_unknown_ids_are_rejected() {
        let original = outline();
        let mut sections = original.sections.clone();
        sections[0].lessons.push(OutlineLesson {
            id: String::new(),
            title: "Added".into(),
            description: String::new(),
            estimated_duration_minutes: 5,
            learning_objectives: vec![],
        });
        let normalized = normalize_sections(&original, sections).unwrap();
        assert_eq!(normalized[0].lessons[0].id, "l1");
        assert!(!normalized[0].lessons[1].id.is_empty());

        let mut bogus = original.sections.clone();
        bogus[0].lessons[0].id = "nope".into();
        let err = normalize_sections(&original, bogus).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
