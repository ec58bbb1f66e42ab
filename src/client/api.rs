use async_trait::async_trait;

use crate::error::Result;
use crate::identity::TenantScope;
use crate::model::{CourseOutline, GeneratedLesson, GenerationJob, OutlinePayload};
use crate::pipeline::Pipeline;

/// Read and cancel jobs. The controller's only polling source.
#[async_trait]
pub trait JobPoller: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<GenerationJob>;

    /// Request cancellation; returns the job as stored afterwards, which may
    /// already be completed or failed if the cancel lost a race.
    async fn cancel_job(&self, job_id: &str) -> Result<GenerationJob>;
}

/// Calls the controller makes against the pipeline. Each submission returns
/// the id of the job it created.
#[async_trait]
pub trait CourseApi: JobPoller {
    async fn generate_outline(&self, input: &OutlinePayload) -> Result<String>;

    async fn get_outline(&self, course_id: &str) -> Result<CourseOutline>;

    async fn approve_outline(&self, course_id: &str, outline_id: &str) -> Result<String>;

    async fn reject_outline(&self, course_id: &str, outline_id: &str, reason: &str)
        -> Result<String>;

    async fn generate_all_lessons(&self, course_id: &str) -> Result<String>;

    async fn list_generated_lessons(&self, course_id: &str) -> Result<Vec<GeneratedLesson>>;
}

/// In-process client bound to one caller.
#[derive(Debug, Clone)]
pub struct LocalApi {
    pipeline: Pipeline,
    scope: TenantScope,
}

impl LocalApi {
    pub fn new(pipeline: Pipeline, scope: TenantScope) -> Self {
        Self { pipeline, scope }
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }
}

#[async_trait]
impl JobPoller for LocalApi {
    async fn get_job(&self, job_id: &str) -> Result<GenerationJob> {
        self.pipeline.get_job(&self.scope, job_id).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<GenerationJob> {
        Ok(self.pipeline.cancel(&self.scope, job_id).await?.into_job())
    }
}

#[async_trait]
impl CourseApi for LocalApi {
    async fn generate_outline(&self, input: &OutlinePayload) -> Result<String> {
        let job = self
            .pipeline
            .generate_outline(&self.scope, input.clone())
            .await?;
        Ok(job.id)
    }

    async fn get_outline(&self, course_id: &str) -> Result<CourseOutline> {
        self.pipeline.get_outline(&self.scope, course_id, None).await
    }

    async fn approve_outline(&self, course_id: &str, outline_id: &str) -> Result<String> {
        let (_, job) = self
            .pipeline
            .approve_outline(&self.scope, course_id, outline_id)
            .await?;
        Ok(job.id)
    }

    async fn reject_outline(
        &self,
        course_id: &str,
        outline_id: &str,
        reason: &str,
    ) -> Result<String> {
        let (_, job) = self
            .pipeline
            .reject_outline(&self.scope, course_id, outline_id, reason)
            .await?;
        Ok(job.id)
    }

    async fn generate_all_lessons(&self, course_id: &str) -> Result<String> {
        let job = self
            .pipeline
            .generate_all_lessons(&self.scope, course_id)
            .await?;
        Ok(job.id)
    }

    async fn list_generated_lessons(&self, course_id: &str) -> Result<Vec<GeneratedLesson>> {
        self.pipeline
            .list_generated_lessons(&self.scope, course_id)
            .await
    }
}
