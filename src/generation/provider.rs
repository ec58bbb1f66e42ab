use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    Checkpoint, ComponentRequest, Generated, GenerationError, IngestionSummary, LessonDraft,
    LessonGenerator, LessonRequest, OutlineDraft, OutlineGenerator, SourceIngestor,
};
use crate::config::Provider;
use crate::model::{OutlinePayload, SmeIngestionPayload};

/// HTTP client for the content-generation service.
///
/// Every task is a `POST {base_url}v1/generate` with `{model, task, input}`;
/// the service answers `{output, usage: {total_tokens}}`.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    output: Value,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: i64,
}

impl ProviderClient {
    pub fn from_config(cfg: &Provider) -> Result<Self> {
        let mut base = cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid provider base_url")?;
        Self::with_base_url(
            cfg.api_key.clone(),
            cfg.model.clone(),
            base_url,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: Url,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("course-forge/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build provider http client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            model,
        })
    }

    pub fn build_request(&self, task: &str, input: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/generate")
            .context("invalid provider base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "task": task,
                "input": input,
            }))
            .build()
            .context("failed to build provider request")
    }

    async fn generate<T: DeserializeOwned>(
        &self,
        task: &str,
        input: Value,
    ) -> Result<Generated<T>, GenerationError> {
        let request = self
            .build_request(task, &input)
            .map_err(|e| GenerationError::Permanent(format!("{e:#}")))?;
        debug!(task, url = %request.url(), "provider request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| GenerationError::Transient(format!("failed to reach provider: {e}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = res
            .text()
            .await
            .map_err(|e| GenerationError::Transient(format!("failed to read provider body: {e}")))?;
        let payload: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Permanent(format!("invalid provider response: {e}")))?;
        let value = serde_json::from_value(payload.output).map_err(|e| {
            GenerationError::Permanent(format!("provider output does not match {task}: {e}"))
        })?;
        Ok(Generated::new(value, payload.usage.total_tokens))
    }
}

/// 429 and 5xx are retryable; any other non-success status is not.
pub fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        warn!(%status, "provider temporarily unavailable: {}", body);
        GenerationError::Transient(format!("provider returned {status}: {body}"))
    } else {
        warn!(%status, "provider rejected request: {}", body);
        GenerationError::Permanent(format!("provider returned {status}: {body}"))
    }
}

#[async_trait]
impl OutlineGenerator for ProviderClient {
    async fn generate_outline(
        &self,
        request: &OutlinePayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<OutlineDraft>, GenerationError> {
        checkpoint.progress(10, "Analyzing knowledge sources").await?;
        let input = json!({
            "course_id": request.course_id,
            "knowledge_source_ids": request.knowledge_source_ids,
            "target_audiences": request.target_audiences,
            "desired_outcomes": request.desired_outcomes,
            "lesson_count_hint": request.lesson_count_hint,
            "guidance": request.guidance,
        });
        let out = self.generate::<OutlineDraft>("course_outline", input).await?;
        checkpoint.progress(90, "Structuring outline").await?;
        Ok(out)
    }
}

#[async_trait]
impl LessonGenerator for ProviderClient {
    async fn generate_lesson(
        &self,
        request: &LessonRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<LessonDraft>, GenerationError> {
        checkpoint.progress(10, "Drafting lesson").await?;
        let input = json!({
            "course_id": request.course_id,
            "section": request.section,
            "lesson": request.lesson,
            "previous_title": request.previous_title,
        });
        let out = self.generate::<LessonDraft>("lesson_content", input).await?;
        checkpoint.progress(90, "Assembling components").await?;
        Ok(out)
    }

    async fn regenerate_component(
        &self,
        request: &ComponentRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<Value>, GenerationError> {
        checkpoint.progress(10, "Regenerating component").await?;
        let input = json!({
            "lesson_title": request.lesson.title,
            "component": request.component,
            "prompt": request.prompt,
        });
        self.generate::<Value>("component_regen", input).await
    }
}

#[async_trait]
impl SourceIngestor for ProviderClient {
    async fn ingest(
        &self,
        request: &SmeIngestionPayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<IngestionSummary>, GenerationError> {
        checkpoint.progress(5, "Fetching source material").await?;
        let input = json!({
            "sme_id": request.sme_id,
            "source_uris": request.source_uris,
        });
        let out = self
            .generate::<IngestionSummary>("sme_ingestion", input)
            .await?;
        checkpoint.progress(95, "Indexing knowledge").await?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ProviderClient {
        ProviderClient::with_base_url(
            "secret".into(),
            "model-x".into(),
            Url::parse("https://provider.invalid/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn request_targets_generate_endpoint_with_bearer() {
        let req = client()
            .build_request("course_outline", &json!({"course_id": "c1"}))
            .unwrap();
        assert_eq!(req.url().as_str(), "https://provider.invalid/v1/generate");
        assert_eq!(req.headers()["Authorization"], "Bearer secret");
        let body: Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["task"], "course_outline");
        assert_eq!(body["model"], "model-x");
        assert_eq!(body["input"]["course_id"], "c1");
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GenerationError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            GenerationError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "content policy"),
            GenerationError::Permanent(_)
        ));
    }
}
