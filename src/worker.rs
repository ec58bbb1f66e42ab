use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, NewOutline};
use crate::error::{PipelineError, Result};
use crate::generation::{
    Checkpoint, ComponentRequest, FakeGenerator, GenerationError, LessonGenerator, LessonRequest,
    OutlineGenerator, ProviderClient, SourceIngestor,
};
use crate::model::{
    ApprovalStatus, ComponentRegenPayload, FullCoursePayload, GeneratedLesson, GenerationJob,
    JobPayload, LessonPayload, OutlinePayload, SmeIngestionPayload,
};
use crate::orchestrator::{Orchestrator, ProgressOutcome};

/// One strategy per pipeline stage.
#[derive(Clone)]
pub struct Generators {
    pub outline: Arc<dyn OutlineGenerator>,
    pub lesson: Arc<dyn LessonGenerator>,
    pub ingestor: Arc<dyn SourceIngestor>,
}

impl Generators {
    pub fn provider(client: ProviderClient) -> Self {
        let client = Arc::new(client);
        Self {
            outline: client.clone(),
            lesson: client.clone(),
            ingestor: client,
        }
    }

    pub fn fake(fake: Arc<FakeGenerator>) -> Self {
        Self {
            outline: fake.clone(),
            lesson: fake.clone(),
            ingestor: fake,
        }
    }
}

/// Checkpoint bound to one claimed job.
struct JobCheckpoint {
    orchestrator: Orchestrator,
    job_id: String,
    worker_id: String,
    token: CancellationToken,
}

#[async_trait]
impl Checkpoint for JobCheckpoint {
    async fn progress(&self, percent: i32, message: &str) -> Result<(), GenerationError> {
        if self.token.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        let outcome = self
            .orchestrator
            .report_progress_from(
                &self.job_id,
                Some(&self.worker_id),
                percent.clamp(0, 100),
                Some(message),
            )
            .await;
        match outcome {
            Ok(ProgressOutcome::Applied(_)) | Ok(ProgressOutcome::Regressed(_)) => Ok(()),
            Ok(ProgressOutcome::Ignored(_)) => Err(GenerationError::Cancelled),
            // Progress is advisory; a store hiccup must not abort generation.
            Err(err) => {
                warn!(job_id = %self.job_id, "failed to record progress: {err}");
                Ok(())
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Why a stage stopped early.
enum StageError {
    Generation(GenerationError),
    Pipeline(PipelineError),
}

impl From<GenerationError> for StageError {
    fn from(err: GenerationError) -> Self {
        StageError::Generation(err)
    }
}

impl From<PipelineError> for StageError {
    fn from(err: PipelineError) -> Self {
        StageError::Pipeline(err)
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::Pipeline(PipelineError::Store(err))
    }
}

impl From<sqlx::Error> for StageError {
    fn from(err: sqlx::Error) -> Self {
        StageError::Pipeline(err.into())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::Pipeline(err.into())
    }
}

type StageResult = std::result::Result<(), StageError>;

#[derive(Clone)]
pub struct Worker {
    id: String,
    orchestrator: Orchestrator,
    generators: Generators,
}

impl Worker {
    pub fn new(id: impl Into<String>, orchestrator: Orchestrator, generators: Generators) -> Self {
        Self {
            id: id.into(),
            orchestrator,
            generators,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run one due job. Returns whether a job was processed.
    #[instrument(skip_all, fields(worker = %self.id))]
    pub async fn process_next_job(&self) -> Result<bool> {
        let Some(job) = self.orchestrator.claim(&self.id).await? else {
            return Ok(false);
        };
        self.execute(job).await?;
        Ok(true)
    }

    /// Process jobs until none is due. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while self.process_next_job().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Run a job this worker has claimed and record its outcome on the job.
    #[instrument(skip_all, fields(job_id = %job.id, kind = job.job_type.as_str()))]
    pub async fn execute(&self, job: GenerationJob) -> Result<()> {
        let checkpoint = JobCheckpoint {
            orchestrator: self.orchestrator.clone(),
            job_id: job.id.clone(),
            worker_id: self.id.clone(),
            token: self
                .orchestrator
                .cancellation_token(&job.id)
                .unwrap_or_default(),
        };

        let outcome = match &job.payload {
            JobPayload::SmeIngestion(p) => self.run_ingestion(&job, p, &checkpoint).await,
            JobPayload::CourseOutline(p) => self.run_outline(&job, p, &checkpoint).await,
            JobPayload::LessonContent(p) => self.run_lesson(&job, p, &checkpoint).await,
            JobPayload::ComponentRegen(p) => self.run_component(&job, p, &checkpoint).await,
            JobPayload::FullCourse(p) => self.run_full_course(&job, p, &checkpoint).await,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(StageError::Generation(err)) => {
                self.orchestrator.handle_failure(&job, &err).await?;
                Ok(())
            }
            Err(StageError::Pipeline(PipelineError::Cancelled)) => {
                self.orchestrator
                    .handle_failure(&job, &GenerationError::Cancelled)
                    .await?;
                Ok(())
            }
            Err(StageError::Pipeline(err)) => {
                error!("stage failed: {err}");
                self.orchestrator.fail(&job.id, &err.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn run_ingestion(
        &self,
        job: &GenerationJob,
        payload: &SmeIngestionPayload,
        checkpoint: &JobCheckpoint,
    ) -> StageResult {
        let out = self.generators.ingestor.ingest(payload, checkpoint).await?;
        let result = serde_json::to_value(&out.value)?;
        self.orchestrator
            .complete(&job.id, result, out.tokens_used)
            .await?;
        Ok(())
    }

    async fn run_outline(
        &self,
        job: &GenerationJob,
        payload: &OutlinePayload,
        checkpoint: &JobCheckpoint,
    ) -> StageResult {
        let out = self
            .generators
            .outline
            .generate_outline(payload, checkpoint)
            .await?;
        let sections = out.value.into_sections();
        if sections.iter().all(|s| s.lessons.is_empty()) {
            return Err(GenerationError::Permanent("generated outline has no lessons".into()).into());
        }

        // The outline becomes visible only together with the completed job.
        let now = Utc::now();
        let mut tx = self.orchestrator.pool().begin().await?;
        let outline = db::insert_outline_version(
            &mut tx,
            &NewOutline {
                tenant_id: job.tenant_id.clone(),
                course_id: payload.course_id.clone(),
                sections,
                source_job_id: Some(job.id.clone()),
            },
            now,
        )
        .await?;
        let result = json!({
            "outline_id": outline.id,
            "version": outline.version,
            "lesson_count": outline.lesson_count(),
        });
        let applied = db::mark_completed(&mut *tx, &job.id, &result, out.tokens_used, now).await?;
        if applied {
            tx.commit().await?;
            info!(outline_id = %outline.id, version = outline.version, "outline version stored");
        } else {
            tx.rollback().await?;
        }
        self.orchestrator.settle(&job.id, applied).await?;
        Ok(())
    }

    async fn run_lesson(
        &self,
        job: &GenerationJob,
        payload: &LessonPayload,
        checkpoint: &JobCheckpoint,
    ) -> StageResult {
        let outline = db::fetch_outline_by_id(self.orchestrator.pool(), &payload.outline_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("outline {}", payload.outline_id)))?;
        let lessons: Vec<_> = outline.lessons().collect();
        let position = lessons
            .iter()
            .position(|(_, l)| l.id == payload.lesson_id)
            .ok_or_else(|| {
                PipelineError::validation(format!(
                    "lesson {} is not part of outline {}",
                    payload.lesson_id, outline.id
                ))
            })?;
        let (section, lesson) = lessons[position];
        let request = LessonRequest {
            course_id: payload.course_id.clone(),
            section: section.clone(),
            lesson: lesson.clone(),
            previous_title: position
                .checked_sub(1)
                .map(|idx| lessons[idx].1.title.clone()),
        };

        let out = self
            .generators
            .lesson
            .generate_lesson(&request, checkpoint)
            .await?;
        let now = Utc::now();
        let draft = out.value;
        let generated = GeneratedLesson {
            id: Uuid::new_v4().to_string(),
            tenant_id: job.tenant_id.clone(),
            course_id: payload.course_id.clone(),
            outline_id: outline.id.clone(),
            section_id: section.id.clone(),
            outline_lesson_id: lesson.id.clone(),
            title: draft.title.clone(),
            segue_text: draft.segue_text.clone(),
            components: draft.into_components(),
            job_id: Some(job.id.clone()),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.orchestrator.pool().begin().await?;
        let stored = db::upsert_generated_lesson(&mut *tx, &generated).await?;
        let result = json!({ "lesson_id": stored.id, "components": stored.components.len() });
        let applied = db::mark_completed(&mut *tx, &job.id, &result, out.tokens_used, now).await?;
        if applied {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        self.orchestrator.settle(&job.id, applied).await?;
        Ok(())
    }

    async fn run_component(
        &self,
        job: &GenerationJob,
        payload: &ComponentRegenPayload,
        checkpoint: &JobCheckpoint,
    ) -> StageResult {
        let lesson = db::fetch_generated_lesson(self.orchestrator.pool(), &payload.lesson_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("lesson {}", payload.lesson_id)))?;
        let component = lesson
            .components
            .iter()
            .find(|c| c.id == payload.component_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::not_found(format!("component {}", payload.component_id))
            })?;
        let request = ComponentRequest {
            lesson,
            component,
            prompt: payload.prompt.clone(),
        };
        let out = self
            .generators
            .lesson
            .regenerate_component(&request, checkpoint)
            .await?;

        let now = Utc::now();
        let mut tx = self.orchestrator.pool().begin().await?;
        if !db::touch_job(&mut *tx, &job.id, now).await? {
            tx.rollback().await?;
            return Err(GenerationError::Cancelled.into());
        }
        // Re-read under the write lock so concurrent edits to sibling
        // components are not lost.
        let mut current = db::fetch_generated_lesson(&mut *tx, &payload.lesson_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("lesson {}", payload.lesson_id)))?;
        let Some(target) = current
            .components
            .iter_mut()
            .find(|c| c.id == payload.component_id)
        else {
            tx.rollback().await?;
            return Err(
                PipelineError::not_found(format!("component {}", payload.component_id)).into(),
            );
        };
        target.content_json = out.value;
        db::update_lesson_components(&mut *tx, &current.id, &current.components, now).await?;
        let result = json!({ "lesson_id": current.id, "component_id": payload.component_id });
        let applied = db::mark_completed(&mut *tx, &job.id, &result, out.tokens_used, now).await?;
        if applied {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        self.orchestrator.settle(&job.id, applied).await?;
        Ok(())
    }

    async fn run_full_course(
        &self,
        job: &GenerationJob,
        payload: &FullCoursePayload,
        checkpoint: &JobCheckpoint,
    ) -> StageResult {
        let outline = db::fetch_outline_by_id(self.orchestrator.pool(), &payload.outline_id)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("outline {}", payload.outline_id)))?;
        if outline.approval_status != ApprovalStatus::Approved {
            return Err(PipelineError::precondition(format!(
                "outline {} is {}, not approved",
                outline.id,
                outline.approval_status.as_str()
            ))
            .into());
        }
        checkpoint
            .progress(
                1,
                &format!("Scheduling {} lessons", outline.lesson_count()),
            )
            .await?;

        let created = self
            .orchestrator
            .fan_out_full_course(job, &outline)
            .await?;
        if created.is_empty() && self.orchestrator.list_children(&job.id).await?.is_empty() {
            self.orchestrator
                .complete(&job.id, json!({ "lessons_completed": 0 }), 0)
                .await?;
            return Ok(());
        }
        // Children may all be terminal already when a parent is re-run.
        self.orchestrator.aggregate_parent(&job.id).await?;
        Ok(())
    }

    /// Poll for work until `shutdown` fires, sleeping `idle` when the queue is empty.
    pub async fn run(self, shutdown: CancellationToken, idle: Duration) {
        info!(worker = %self.id, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let processed = match self.process_next_job().await {
                Ok(processed) => processed,
                Err(err) => {
                    error!(worker = %self.id, "worker iteration failed: {err:#}");
                    false
                }
            };
            if processed {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}

pub fn spawn_workers(
    count: usize,
    orchestrator: &Orchestrator,
    generators: &Generators,
    shutdown: &CancellationToken,
    idle: Duration,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|n| {
            let worker = Worker::new(
                format!("worker-{n}-{}", Uuid::new_v4().simple()),
                orchestrator.clone(),
                generators.clone(),
            );
            tokio::spawn(worker.run(shutdown.clone(), idle))
        })
        .collect()
}
