//! Client-side generation controller.
//!
//! Mirrors the server pipeline as an explicit state machine so a wizard UI
//! can drive it:
//!
//! ```text
//! configure -> generatingOutline -> reviewOutline -> jobQueued -> generatingLessons -> complete
//!                     ^                  |               |
//!                     +--- regenerate ---+               +-- navigate away --> backgroundGeneration
//! ```
//!
//! The controller is the only thing that polls: while a stage is generating
//! it reads the job on a fixed interval until the job is terminal. Anything
//! else that shows job data reads it once.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{PipelineError, Result};
use crate::model::{CourseOutline, GenerationJob, JobStatus, OutlinePayload};

pub mod api;
pub mod transform;

pub use api::{CourseApi, JobPoller, LocalApi};
pub use transform::{to_course_content, CourseContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Outline,
    Lessons,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub percent: i32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    Configure,
    GeneratingOutline {
        job_id: String,
        progress: JobProgress,
    },
    ReviewOutline {
        outline: CourseOutline,
    },
    /// Lesson generation is submitted; waiting for the user to watch or leave.
    JobQueued {
        job_id: String,
    },
    GeneratingLessons {
        job_id: String,
        progress: JobProgress,
    },
    Complete {
        content: CourseContent,
    },
    /// Terminal for this controller; completion arrives as a notification.
    BackgroundGeneration {
        job_id: String,
    },
    Failed {
        stage: Stage,
        error: String,
    },
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Configure => "configure",
            ControllerState::GeneratingOutline { .. } => "generatingOutline",
            ControllerState::ReviewOutline { .. } => "reviewOutline",
            ControllerState::JobQueued { .. } => "jobQueued",
            ControllerState::GeneratingLessons { .. } => "generatingLessons",
            ControllerState::Complete { .. } => "complete",
            ControllerState::BackgroundGeneration { .. } => "backgroundGeneration",
            ControllerState::Failed { .. } => "failed",
        }
    }

    /// The job being polled and its stage, while generating.
    pub fn polling(&self) -> Option<(&str, Stage)> {
        match self {
            ControllerState::GeneratingOutline { job_id, .. } => Some((job_id, Stage::Outline)),
            ControllerState::GeneratingLessons { job_id, .. } => Some((job_id, Stage::Lessons)),
            _ => None,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.polling().is_some()
    }

    pub fn progress(&self) -> Option<&JobProgress> {
        match self {
            ControllerState::GeneratingOutline { progress, .. }
            | ControllerState::GeneratingLessons { progress, .. } => Some(progress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub outline_poll: Duration,
    pub lesson_poll: Duration,
    /// Consecutive failed polls tolerated before `wait_for_terminal` gives up.
    pub max_network_errors: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            outline_poll: Duration::from_secs(3),
            lesson_poll: Duration::from_secs(7),
            max_network_errors: 5,
        }
    }
}

impl From<&config::Client> for ControllerConfig {
    fn from(cfg: &config::Client) -> Self {
        Self {
            outline_poll: Duration::from_millis(cfg.outline_poll_ms),
            lesson_poll: Duration::from_millis(cfg.lesson_poll_ms),
            ..Self::default()
        }
    }
}

pub struct GenerationController<A> {
    api: A,
    config: ControllerConfig,
    state: ControllerState,
    /// Form input captured at submission; kept across failures for retry.
    input: Option<OutlinePayload>,
    outline: Option<CourseOutline>,
    network_error: bool,
}

impl<A: CourseApi> GenerationController<A> {
    pub fn new(api: A, config: ControllerConfig) -> Self {
        Self {
            api,
            config,
            state: ControllerState::Configure,
            input: None,
            outline: None,
            network_error: false,
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn input(&self) -> Option<&OutlinePayload> {
        self.input.as_ref()
    }

    /// Whether the last call failed on the transport. Recoverable: the state
    /// and captured input are untouched.
    pub fn network_error(&self) -> bool {
        self.network_error
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn track<T>(&mut self, res: Result<T>) -> Result<T> {
        match &res {
            Ok(_) => self.network_error = false,
            Err(PipelineError::Network(msg)) => {
                warn!("network error: {msg}");
                self.network_error = true;
            }
            Err(_) => {}
        }
        res
    }

    fn invalid(&self, action: &str) -> PipelineError {
        PipelineError::precondition(format!("cannot {action} in state {}", self.state.name()))
    }

    fn course_id(&self) -> Result<String> {
        self.input
            .as_ref()
            .map(|i| i.course_id.clone())
            .ok_or_else(|| PipelineError::precondition("no course configured"))
    }

    fn poll_interval(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Outline => self.config.outline_poll,
            Stage::Lessons => self.config.lesson_poll,
        }
    }

    /// Submit outline generation for `input` and start generating.
    pub async fn submit(&mut self, input: OutlinePayload) -> Result<()> {
        if !matches!(
            self.state,
            ControllerState::Configure
                | ControllerState::Failed {
                    stage: Stage::Outline,
                    ..
                }
        ) {
            return Err(self.invalid("submit"));
        }
        self.input = Some(input.clone());
        let res = self.api.generate_outline(&input).await;
        let job_id = self.track(res)?;
        info!(job_id = %job_id, "outline generation started");
        self.state = ControllerState::GeneratingOutline {
            job_id,
            progress: JobProgress::default(),
        };
        Ok(())
    }

    /// Read the polled job once and advance on a terminal status.
    pub async fn poll_once(&mut self) -> Result<()> {
        let Some((job_id, stage)) = self.state.polling().map(|(id, s)| (id.to_string(), s)) else {
            return Err(self.invalid("poll"));
        };
        let res = self.api.get_job(&job_id).await;
        let job = self.track(res)?;
        self.apply_job(stage, job).await
    }

    async fn apply_job(&mut self, stage: Stage, job: GenerationJob) -> Result<()> {
        match job.status {
            JobStatus::Queued | JobStatus::Processing => {
                if let ControllerState::GeneratingOutline { job_id, progress }
                | ControllerState::GeneratingLessons { job_id, progress } = &mut self.state
                {
                    if *job_id == job.id {
                        progress.percent = progress.percent.max(job.progress_percent);
                        progress.message = job.progress_message.clone();
                    }
                }
                Ok(())
            }
            JobStatus::Completed => match stage {
                Stage::Outline => {
                    let res = self.api.get_outline(&self.course_id()?).await;
                    let outline = self.track(res)?;
                    self.outline = Some(outline.clone());
                    self.state = ControllerState::ReviewOutline { outline };
                    Ok(())
                }
                Stage::Lessons => {
                    let course_id = self.course_id()?;
                    let res = self.api.get_outline(&course_id).await;
                    let outline = self.track(res)?;
                    let res = self.api.list_generated_lessons(&course_id).await;
                    let lessons = self.track(res)?;
                    let content = to_course_content(&outline, &lessons);
                    self.outline = Some(outline);
                    self.state = ControllerState::Complete { content };
                    Ok(())
                }
            },
            JobStatus::Failed => {
                self.state = ControllerState::Failed {
                    stage,
                    error: job
                        .error_message
                        .unwrap_or_else(|| "generation failed".into()),
                };
                Ok(())
            }
            JobStatus::Cancelled => {
                self.state = match stage {
                    Stage::Outline => ControllerState::Configure,
                    Stage::Lessons => self.review_state().await,
                };
                Ok(())
            }
        }
    }

    /// Back to review with the freshest outline we can get.
    async fn review_state(&mut self) -> ControllerState {
        if let Ok(course_id) = self.course_id() {
            let res = self.api.get_outline(&course_id).await;
            if let Ok(outline) = self.track(res) {
                self.outline = Some(outline);
            }
        }
        match &self.outline {
            Some(outline) => ControllerState::ReviewOutline {
                outline: outline.clone(),
            },
            None => ControllerState::Configure,
        }
    }

    /// Poll until the current stage's job is terminal. Transport failures are
    /// retried up to `max_network_errors` times in a row.
    pub async fn wait_for_terminal(&mut self) -> Result<&ControllerState> {
        let mut consecutive = 0;
        loop {
            let Some((_, stage)) = self.state.polling() else {
                return Ok(&self.state);
            };
            match self.poll_once().await {
                Ok(()) => consecutive = 0,
                Err(PipelineError::Network(msg)) => {
                    consecutive += 1;
                    if consecutive > self.config.max_network_errors {
                        return Err(PipelineError::Network(msg));
                    }
                }
                Err(err) => return Err(err),
            }
            if !self.state.is_generating() {
                return Ok(&self.state);
            }
            tokio::time::sleep(self.poll_interval(stage)).await;
        }
    }

    /// Approve the reviewed outline. Lesson generation is submitted and the
    /// controller waits in `JobQueued` for the user's choice.
    pub async fn approve(&mut self) -> Result<()> {
        let ControllerState::ReviewOutline { outline } = &self.state else {
            return Err(self.invalid("approve"));
        };
        let outline = outline.clone();
        let res = if outline.approval_status == crate::model::ApprovalStatus::Approved {
            self.api.generate_all_lessons(&outline.course_id).await
        } else {
            self.api
                .approve_outline(&outline.course_id, &outline.id)
                .await
        };
        let job_id = self.track(res)?;
        info!(job_id = %job_id, "lesson generation submitted");
        self.outline = Some(outline);
        self.state = ControllerState::JobQueued { job_id };
        Ok(())
    }

    /// Reject the reviewed outline; `reason` guides the regeneration that
    /// starts immediately.
    pub async fn reject(&mut self, reason: &str) -> Result<()> {
        let ControllerState::ReviewOutline { outline } = &self.state else {
            return Err(self.invalid("reject"));
        };
        let (course_id, outline_id) = (outline.course_id.clone(), outline.id.clone());
        let res = self.api.reject_outline(&course_id, &outline_id, reason).await;
        let job_id = self.track(res)?;
        self.state = ControllerState::GeneratingOutline {
            job_id,
            progress: JobProgress::default(),
        };
        Ok(())
    }

    pub async fn regenerate(&mut self, reason: &str) -> Result<()> {
        self.reject(reason).await
    }

    /// Stay attached and poll lesson generation.
    pub fn watch(&mut self) -> Result<()> {
        let ControllerState::JobQueued { job_id } = &self.state else {
            return Err(self.invalid("watch"));
        };
        self.state = ControllerState::GeneratingLessons {
            job_id: job_id.clone(),
            progress: JobProgress::default(),
        };
        Ok(())
    }

    /// Detach; the job keeps running.
    pub fn navigate_away(&mut self) -> Result<()> {
        let ControllerState::JobQueued { job_id } = &self.state else {
            return Err(self.invalid("navigate away"));
        };
        debug!(job_id = %job_id, "detached from lesson generation");
        self.state = ControllerState::BackgroundGeneration {
            job_id: job_id.clone(),
        };
        Ok(())
    }

    /// Cancel the running stage. The job as stored afterwards decides the
    /// next state, so a cancel that lost a race to completion still lands
    /// on the completed outcome.
    pub async fn cancel(&mut self) -> Result<()> {
        let Some((job_id, stage)) = self.state.polling().map(|(id, s)| (id.to_string(), s)) else {
            return Err(self.invalid("cancel"));
        };
        let res = self.api.cancel_job(&job_id).await;
        let job = self.track(res)?;
        self.apply_job(stage, job).await
    }

    /// Re-enter a failed stage from scratch with a new job. Also resubmits
    /// the captured input after a submission lost to the network.
    pub async fn retry(&mut self) -> Result<()> {
        let stage = match self.state {
            ControllerState::Failed { stage, .. } => stage,
            ControllerState::Configure if self.network_error => Stage::Outline,
            _ => return Err(self.invalid("retry")),
        };
        match stage {
            Stage::Outline => {
                let input = self
                    .input
                    .clone()
                    .ok_or_else(|| PipelineError::precondition("no captured input to retry"))?;
                self.submit(input).await
            }
            Stage::Lessons => {
                let course_id = self.course_id()?;
                let res = self.api.generate_all_lessons(&course_id).await;
                let job_id = self.track(res)?;
                self.state = ControllerState::GeneratingLessons {
                    job_id,
                    progress: JobProgress::default(),
                };
                Ok(())
            }
        }
    }
}
