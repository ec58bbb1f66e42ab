mod common;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use course_forge::client::{
    ControllerConfig, ControllerState, CourseApi, GenerationController, JobPoller, LocalApi, Stage,
};
use course_forge::error::{PipelineError, Result};
use course_forge::model::{
    ApprovalStatus, CourseOutline, FullCoursePayload, GeneratedLesson, GenerationJob, JobPayload,
    JobStatus, OutlineLesson, OutlinePayload, OutlineSection,
};
use course_forge::worker::spawn_workers;

#[derive(Default)]
struct Script {
    polls: HashMap<String, VecDeque<(JobStatus, i32)>>,
    last: HashMap<String, GenerationJob>,
    cancel_lands_on: Option<JobStatus>,
    network_failures: usize,
    next_id: usize,
    outline_status: Option<ApprovalStatus>,
    get_job_calls: usize,
    submissions: Vec<&'static str>,
}

#[derive(Clone, Default)]
struct ScriptedApi {
    script: Arc<Mutex<Script>>,
}

impl ScriptedApi {
    fn poll_script(&self, job_id: &str, steps: &[(JobStatus, i32)]) {
        self.script
            .lock()
            .unwrap()
            .polls
            .insert(job_id.to_string(), steps.iter().copied().collect());
    }

    fn fail_network(&self, calls: usize) {
        self.script.lock().unwrap().network_failures = calls;
    }

    fn cancel_lands_on(&self, status: JobStatus) {
        self.script.lock().unwrap().cancel_lands_on = Some(status);
    }

    fn get_job_calls(&self) -> usize {
        self.script.lock().unwrap().get_job_calls
    }

    fn submissions(&self) -> Vec<&'static str> {
        self.script.lock().unwrap().submissions.clone()
    }

    fn transport(&self) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        if script.network_failures > 0 {
            script.network_failures -= 1;
            return Err(PipelineError::Network("connection reset".into()));
        }
        Ok(())
    }

    fn submit(&self, kind: &'static str) -> Result<String> {
        self.transport()?;
        let mut script = self.script.lock().unwrap();
        script.next_id += 1;
        script.submissions.push(kind);
        Ok(format!("job-{}", script.next_id))
    }
}

fn job(id: &str, status: JobStatus, progress: i32) -> GenerationJob {
    let now = Utc::now();
    GenerationJob {
        id: id.to_string(),
        tenant_id: "t1".into(),
        user_id: "u1".into(),
        parent_job_id: None,
        course_id: Some("course-1".into()),
        job_type: course_forge::model::JobType::FullCourse,
        status,
        payload: JobPayload::FullCourse(FullCoursePayload {
            course_id: "course-1".into(),
            outline_id: "o1".into(),
        }),
        result: None,
        progress_percent: progress,
        progress_message: Some(format!("at {progress}")),
        retry_count: 0,
        max_retries: 3,
        error_message: (status == JobStatus::Failed).then(|| "provider exploded".to_string()),
        tokens_used: 0,
        run_at: now,
        claimed_by: None,
        heartbeat_at: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

fn outline(status: ApprovalStatus) -> CourseOutline {
    let now = Utc::now();
    CourseOutline {
        id: "o1".into(),
        tenant_id: "t1".into(),
        course_id: "course-1".into(),
        version: 1,
        approval_status: status,
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

#[async_trait]
impl JobPoller for ScriptedApi {
    async fn get_job(&self, job_id: &str) -> Result<GenerationJob> {
        self.transport()?;
        let mut script = self.script.lock().unwrap();
        script.get_job_calls += 1;
        let next = script
            .polls
            .get_mut(job_id)
            .and_then(|steps| steps.pop_front())
            .map(|(status, progress)| job(job_id, status, progress));
        match next {
            Some(job) => {
                script.last.insert(job_id.to_string(), job.clone());
                Ok(job)
            }
            None => script
                .last
                .get(job_id)
                .cloned()
                .ok_or_else(|| PipelineError::not_found(job_id.to_string())),
        }
    }

    async fn cancel_job(&self, job_id: &str) -> Result<GenerationJob> {
        self.transport()?;
        let status = self
            .script
            .lock()
            .unwrap()
            .cancel_lands_on
            .unwrap_or(JobStatus::Cancelled);
        Ok(job(job_id, status, 40))
    }
}

#[async_trait]
impl CourseApi for ScriptedApi {
    async fn generate_outline(&self, _input: &OutlinePayload) -> Result<String> {
        self.submit("generate_outline")
    }

    async fn get_outline(&self, _course_id: &str) -> Result<CourseOutline> {
        self.transport()?;
        let status = self
            .script
            .lock()
            .unwrap()
            .outline_status
            .unwrap_or(ApprovalStatus::PendingReview);
        Ok(outline(status))
    }

    async fn approve_outline(&self, _course_id: &str, _outline_id: &str) -> Result<String> {
        let id = self.submit("approve_outline")?;
        self.script.lock().unwrap().outline_status = Some(ApprovalStatus::Approved);
        Ok(id)
    }

    async fn reject_outline(&self, _course_id: &str, _outline_id: &str, _reason: &str) -> Result<String> {
        self.submit("reject_outline")
    }

    async fn generate_all_lessons(&self, _course_id: &str) -> Result<String> {
        self.submit("generate_all_lessons")
    }

    async fn list_generated_lessons(&self, _course_id: &str) -> Result<Vec<GeneratedLesson>> {
        self.transport()?;
        Ok(Vec::new())
    }
}

fn input() -> OutlinePayload {
    common::outline_input("course-1")
}

fn controller(api: &ScriptedApi) -> GenerationController<ScriptedApi> {
    GenerationController::new(api.clone(), ControllerConfig::default())
}

#[tokio::test(start_paused = true)]
async fn walks_every_stage_polling_at_the_configured_cadence() {
    let api = ScriptedApi::default();
    api.poll_script(
        "job-1",
        &[
            (JobStatus::Processing, 20),
            (JobStatus::Processing, 60),
            (JobStatus::Completed, 100),
        ],
    );
    api.poll_script("job-2", &[(JobStatus::Processing, 50), (JobStatus::Completed, 100)]);
    let mut ctl = controller(&api);

    ctl.submit(input()).await.unwrap();
    assert!(matches!(ctl.state(), ControllerState::GeneratingOutline { .. }));
    ctl.poll_once().await.unwrap();
    assert_eq!(ctl.state().progress().unwrap().percent, 20);

    let start = Instant::now();
    ctl.wait_for_terminal().await.unwrap();
    // Two more polls, three seconds apart.
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert!(start.elapsed() < Duration::from_secs(7));
    let ControllerState::ReviewOutline { outline } = ctl.state() else {
        panic!("expected review, got {}", ctl.state().name());
    };
    assert_eq!(outline.approval_status, ApprovalStatus::PendingReview);

    ctl.approve().await.unwrap();
    assert_eq!(
        ctl.state(),
        &ControllerState::JobQueued {
            job_id: "job-2".into()
        }
    );
    ctl.watch().unwrap();

    let start = Instant::now();
    ctl.wait_for_terminal().await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(7));
    let ControllerState::Complete { content } = ctl.state() else {
        panic!("expected complete, got {}", ctl.state().name());
    };
    assert_eq!(content.lesson_count(), 1);
    assert_eq!(content.generated_count(), 0);
    assert_eq!(api.submissions(), vec!["generate_outline", "approve_outline"]);
}

#[tokio::test(start_paused = true)]
async fn navigating_away_stops_polling() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Completed, 100)]);
    let mut ctl = controller(&api);
    ctl.submit(input()).await.unwrap();
    ctl.wait_for_terminal().await.unwrap();
    ctl.approve().await.unwrap();

    let polls = api.get_job_calls();
    ctl.navigate_away().unwrap();
    assert_eq!(
        ctl.state(),
        &ControllerState::BackgroundGeneration {
            job_id: "job-2".into()
        }
    );
    ctl.wait_for_terminal().await.unwrap();
    assert_eq!(api.get_job_calls(), polls);
    assert!(matches!(ctl.poll_once().await, Err(PipelineError::Precondition(_))));
}

#[tokio::test(start_paused = true)]
async fn network_errors_keep_the_captured_input() {
    let api = ScriptedApi::default();
    api.fail_network(1);
    let mut ctl = controller(&api);

    let err = ctl.submit(input()).await.unwrap_err();
    assert!(err.is_recoverable());
    assert!(ctl.network_error());
    assert_eq!(ctl.state(), &ControllerState::Configure);
    assert_eq!(ctl.input(), Some(&input()));

    ctl.retry().await.unwrap();
    assert!(!ctl.network_error());
    assert!(matches!(ctl.state(), ControllerState::GeneratingOutline { .. }));
}

#[tokio::test(start_paused = true)]
async fn polling_rides_out_brief_network_failures() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Completed, 100)]);
    let mut ctl = controller(&api);
    ctl.submit(input()).await.unwrap();

    api.fail_network(2);
    ctl.wait_for_terminal().await.unwrap();
    assert!(matches!(ctl.state(), ControllerState::ReviewOutline { .. }));
    assert!(!ctl.network_error());
}

#[tokio::test(start_paused = true)]
async fn persistent_network_failure_surfaces_without_losing_state() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Completed, 100)]);
    let mut ctl = GenerationController::new(
        api.clone(),
        ControllerConfig {
            max_network_errors: 2,
            ..ControllerConfig::default()
        },
    );
    ctl.submit(input()).await.unwrap();

    api.fail_network(10);
    let err = ctl.wait_for_terminal().await.unwrap_err();
    assert!(matches!(err, PipelineError::Network(_)));
    assert!(ctl.network_error());
    assert!(matches!(ctl.state(), ControllerState::GeneratingOutline { .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_stage_surfaces_the_error_and_retries_from_scratch() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Failed, 30)]);
    api.poll_script("job-2", &[(JobStatus::Completed, 100)]);
    let mut ctl = controller(&api);
    ctl.submit(input()).await.unwrap();
    ctl.wait_for_terminal().await.unwrap();

    assert_eq!(
        ctl.state(),
        &ControllerState::Failed {
            stage: Stage::Outline,
            error: "provider exploded".into()
        }
    );
    ctl.retry().await.unwrap();
    match ctl.state() {
        ControllerState::GeneratingOutline { job_id, .. } => assert_eq!(job_id, "job-2"),
        other => panic!("unexpected state {}", other.name()),
    }
    ctl.wait_for_terminal().await.unwrap();
    assert!(matches!(ctl.state(), ControllerState::ReviewOutline { .. }));
}

#[tokio::test(start_paused = true)]
async fn failed_lessons_retry_with_a_new_job() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Completed, 100)]);
    api.poll_script("job-2", &[(JobStatus::Failed, 50)]);
    let mut ctl = controller(&api);
    ctl.submit(input()).await.unwrap();
    ctl.wait_for_terminal().await.unwrap();
    ctl.approve().await.unwrap();
    ctl.watch().unwrap();
    ctl.wait_for_terminal().await.unwrap();
    assert!(matches!(
        ctl.state(),
        ControllerState::Failed {
            stage: Stage::Lessons,
            ..
        }
    ));

    ctl.retry().await.unwrap();
    assert_eq!(
        api.submissions(),
        vec!["generate_outline", "approve_outline", "generate_all_lessons"]
    );
    assert!(matches!(ctl.state(), ControllerState::GeneratingLessons { .. }));
}

#[tokio::test(start_paused = true)]
async fn cancel_accepts_whichever_outcome_the_job_reached() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Processing, 10)]);
    let mut ctl = controller(&api);
    ctl.submit(input()).await.unwrap();
    ctl.cancel().await.unwrap();
    assert_eq!(ctl.state(), &ControllerState::Configure);

    // The next attempt finished before the cancel arrived.
    ctl.submit(input()).await.unwrap();
    api.cancel_lands_on(JobStatus::Completed);
    ctl.cancel().await.unwrap();
    assert!(matches!(ctl.state(), ControllerState::ReviewOutline { .. }));

    // Cancelling lesson generation returns to the approved outline.
    api.cancel_lands_on(JobStatus::Cancelled);
    ctl.approve().await.unwrap();
    ctl.watch().unwrap();
    ctl.cancel().await.unwrap();
    let ControllerState::ReviewOutline { outline } = ctl.state() else {
        panic!("expected review, got {}", ctl.state().name());
    };
    assert_eq!(outline.approval_status, ApprovalStatus::Approved);

    // Approving again goes straight to lesson generation.
    ctl.approve().await.unwrap();
    assert_eq!(api.submissions().last(), Some(&"generate_all_lessons"));
}

#[tokio::test(start_paused = true)]
async fn rejection_regenerates_and_guards_invalid_actions() {
    let api = ScriptedApi::default();
    api.poll_script("job-1", &[(JobStatus::Completed, 100)]);
    let mut ctl = controller(&api);

    assert!(matches!(ctl.approve().await, Err(PipelineError::Precondition(_))));
    assert!(matches!(ctl.watch(), Err(PipelineError::Precondition(_))));
    assert!(matches!(ctl.cancel().await, Err(PipelineError::Precondition(_))));

    ctl.submit(input()).await.unwrap();
    assert!(matches!(ctl.submit(input()).await, Err(PipelineError::Precondition(_))));
    ctl.wait_for_terminal().await.unwrap();

    ctl.regenerate("needs more depth").await.unwrap();
    match ctl.state() {
        ControllerState::GeneratingOutline { job_id, progress } => {
            assert_eq!(job_id, "job-2");
            assert_eq!(progress.percent, 0);
        }
        other => panic!("unexpected state {}", other.name()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drives_the_local_pipeline_end_to_end() {
    let h = common::harness().await;
    let shutdown = CancellationToken::new();
    let workers = spawn_workers(
        1,
        h.pipeline.orchestrator(),
        &course_forge::worker::Generators::fake(h.fake.clone()),
        &shutdown,
        Duration::from_millis(5),
    );
    let api = LocalApi::new(h.pipeline.clone(), h.scope.clone());
    let mut ctl = GenerationController::new(
        api,
        ControllerConfig {
            outline_poll: Duration::from_millis(10),
            lesson_poll: Duration::from_millis(10),
            max_network_errors: 0,
        },
    );

    ctl.submit(input()).await.unwrap();
    ctl.wait_for_terminal().await.unwrap();
    ctl.regenerate("shorter lessons").await.unwrap();
    ctl.wait_for_terminal().await.unwrap();
    let ControllerState::ReviewOutline { outline } = ctl.state() else {
        panic!("expected review, got {}", ctl.state().name());
    };
    assert_eq!(outline.version, 2);

    ctl.approve().await.unwrap();
    ctl.watch().unwrap();
    ctl.wait_for_terminal().await.unwrap();
    let ControllerState::Complete { content } = ctl.state() else {
        panic!("expected complete, got {}", ctl.state().name());
    };
    assert_eq!(content.outline_version, 2);
    assert_eq!(content.generated_count(), content.lesson_count());
    assert!(content.sections[0].lessons[0].blocks.len() >= 3);

    shutdown.cancel();
    for handle in workers {
        handle.await.unwrap();
    }
}
