mod common;

use common::{harness, outline_input};
use course_forge::db::JobFilter;
use course_forge::error::PipelineError;
use course_forge::model::{
    ApprovalStatus, JobPayload, JobStatus, JobType, NotificationType, OutlineLesson,
};

#[tokio::test]
async fn approval_submits_exactly_one_full_course_job() {
    let h = harness().await;
    let outline = h.pending_outline("course-1").await;

    let (first, second) = tokio::join!(
        h.pipeline.approve_outline(&h.scope, "course-1", &outline.id),
        h.pipeline.approve_outline(&h.scope, "course-1", &outline.id),
    );
    let results = [first, second];
    let approved: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(approved.len(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(PipelineError::Precondition(_)))));

    let (stored, job) = approved[0];
    assert_eq!(stored.approval_status, ApprovalStatus::Approved);
    assert_eq!(job.job_type, JobType::FullCourse);
    match &job.payload {
        JobPayload::FullCourse(p) => assert_eq!(p.outline_id, outline.id),
        other => panic!("unexpected payload {other:?}"),
    }

    let filter = JobFilter {
        job_type: Some(JobType::FullCourse),
        ..JobFilter::for_tenant(&h.scope.tenant_id)
    };
    assert_eq!(h.pipeline.list_jobs(&h.scope, filter).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejection_regenerates_with_the_reason_as_guidance() {
    let h = harness().await;
    let v1 = h.pending_outline("course-1").await;

    let err = h
        .pipeline
        .reject_outline(&h.scope, "course-1", &v1.id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let (rejected, job) = h
        .pipeline
        .reject_outline(&h.scope, "course-1", &v1.id, "more hands-on examples")
        .await
        .unwrap();
    assert_eq!(rejected.approval_status, ApprovalStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("more hands-on examples"));
    match &job.payload {
        JobPayload::CourseOutline(p) => {
            assert_eq!(p.guidance.as_deref(), Some("more hands-on examples"));
            assert_eq!(p.knowledge_source_ids, outline_input("course-1").knowledge_source_ids);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    h.drain().await;
    let v2 = h
        .pipeline
        .get_outline(&h.scope, "course-1", None)
        .await
        .unwrap();
    assert_eq!(v2.version, 2);
    assert_eq!(v2.approval_status, ApprovalStatus::PendingReview);
    assert!(v2.sections[0].description.contains("more hands-on examples"));

    // A rejected version can no longer be approved.
    let err = h
        .pipeline
        .approve_outline(&h.scope, "course-1", &v1.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
}

#[tokio::test]
async fn at_most_one_version_awaits_review() {
    let h = harness().await;
    h.pending_outline("course-1").await;
    // A second generation without reviewing the first.
    h.pending_outline("course-1").await;
    h.pending_outline("course-1").await;

    let versions = h
        .pipeline
        .list_outline_versions(&h.scope, "course-1")
        .await
        .unwrap();
    assert_eq!(versions.len(), 3);
    let pending: Vec<_> = versions
        .iter()
        .filter(|o| o.approval_status == ApprovalStatus::PendingReview)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].version, 3);
    assert!(versions[0].superseded_at.is_some());

    let v1 = h
        .pipeline
        .get_outline(&h.scope, "course-1", Some(1))
        .await
        .unwrap();
    assert_eq!(v1.approval_status, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn revision_round_trip_requests_approval_again() {
    let h = harness().await;
    let outline = h.pending_outline("course-1").await;

    let revising = h
        .pipeline
        .request_revision(&h.scope, "course-1", &outline.id, "split lesson 2")
        .await
        .unwrap();
    assert_eq!(revising.approval_status, ApprovalStatus::RevisionRequested);
    assert_eq!(revising.revision_notes.as_deref(), Some("split lesson 2"));

    let err = h
        .pipeline
        .approve_outline(&h.scope, "course-1", &outline.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    let back = h
        .pipeline
        .resubmit_outline(&h.scope, "course-1", &outline.id)
        .await
        .unwrap();
    assert_eq!(back.approval_status, ApprovalStatus::PendingReview);

    let inbox = h.pipeline.list_notifications(&h.scope, true, 10).await.unwrap();
    let types: Vec<_> = inbox.iter().map(|n| n.notification_type).collect();
    assert!(types.contains(&NotificationType::OutlineReady));
    assert!(types.contains(&NotificationType::ApprovalRequested));
}

#[tokio::test]
async fn edits_keep_ids_and_protect_generated_lessons() {
    let h = harness().await;
    let outline = h.pending_outline("course-1").await;

    let mut sections = outline.sections.clone();
    sections[0].lessons[0].title = "Renamed".into();
    sections[0].lessons.push(OutlineLesson {
        id: String::new(),
        title: "Bonus".into(),
        description: "extra".into(),
        estimated_duration_minutes: 5,
        learning_objectives: vec![],
    });
    let edited = h
        .pipeline
        .update_outline(&h.scope, "course-1", &outline.id, sections)
        .await
        .unwrap();
    assert_eq!(edited.approval_status, ApprovalStatus::PendingReview);
    assert_eq!(edited.sections[0].lessons[0].id, outline.sections[0].lessons[0].id);
    assert_eq!(edited.sections[0].lessons[0].title, "Renamed");
    assert_eq!(edited.lesson_count(), outline.lesson_count() + 1);

    let mut bad = edited.sections.clone();
    bad[0].lessons[0].title = " ".into();
    let err = h
        .pipeline
        .update_outline(&h.scope, "course-1", &outline.id, bad)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    // Generate content, then try to drop a lesson that has it.
    h.pipeline
        .approve_outline(&h.scope, "course-1", &outline.id)
        .await
        .unwrap();
    h.drain().await;
    let mut dropped = edited.sections.clone();
    dropped[0].lessons.remove(0);
    let err = h
        .pipeline
        .update_outline(&h.scope, "course-1", &outline.id, dropped)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
}

#[tokio::test]
async fn lesson_generation_needs_an_approved_outline_and_runs_once() {
    let h = harness().await;
    let outline = h.pending_outline("course-1").await;

    let err = h
        .pipeline
        .generate_all_lessons(&h.scope, "course-1")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));
    assert!(h
        .pipeline
        .list_generated_lessons(&h.scope, "course-1")
        .await
        .unwrap()
        .is_empty());

    let (_, job) = h
        .pipeline
        .approve_outline(&h.scope, "course-1", &outline.id)
        .await
        .unwrap();
    let err = h
        .pipeline
        .generate_all_lessons(&h.scope, "course-1")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Precondition(_)));

    h.drain().await;
    assert_eq!(h.job(&job.id).await.status, JobStatus::Completed);

    // Once finished, the course can be regenerated.
    let rerun = h
        .pipeline
        .generate_all_lessons(&h.scope, "course-1")
        .await
        .unwrap();
    assert_eq!(rerun.status, JobStatus::Queued);
}

#[tokio::test]
async fn outlines_of_other_tenants_are_not_found() {
    let h = harness().await;
    let outline = h.pending_outline("course-1").await;
    let intruder = course_forge::identity::TenantScope::new("tenant-b", "user-b");

    let err = h
        .pipeline
        .get_outline(&intruder, "course-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
    let err = h
        .pipeline
        .approve_outline(&intruder, "course-1", &outline.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
    let err = h
        .pipeline
        .generate_outline(&intruder, outline_input("course-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}
