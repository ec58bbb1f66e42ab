use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    Checkpoint, ComponentDraft, ComponentRequest, Generated, GenerationError, IngestionSummary,
    LessonDraft, LessonGenerator, LessonOutlineDraft, LessonRequest, OutlineDraft,
    OutlineGenerator, SectionDraft, SourceIngestor,
};
use crate::model::{Alignment, ComponentType, OutlinePayload, SmeIngestionPayload};

const TOKENS_PER_CALL: i64 = 120;
const DEFAULT_LESSON_COUNT: u32 = 4;

/// Deterministic generator for every stage.
///
/// Failures can be scripted: `fail_next` queues errors consumed by the next
/// calls of any stage, `fail_always` makes every call fail, and
/// `fail_lesson_titled` fails lesson generation for one outline lesson.
#[derive(Debug, Default)]
pub struct FakeGenerator {
    step_delay: Duration,
    queued_failures: Mutex<VecDeque<GenerationError>>,
    always: Mutex<Option<GenerationError>>,
    failing_lessons: Mutex<HashSet<String>>,
    outline_calls: AtomicUsize,
    lesson_calls: AtomicUsize,
    component_calls: AtomicUsize,
    ingest_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep between checkpoints so pollers can observe intermediate progress.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn fail_next(&self, err: GenerationError) {
        if let Ok(mut q) = self.queued_failures.lock() {
            q.push_back(err);
        }
    }

    pub fn fail_always(&self, err: GenerationError) {
        if let Ok(mut a) = self.always.lock() {
            *a = Some(err);
        }
    }

    pub fn fail_lesson_titled(&self, title: impl Into<String>) {
        if let Ok(mut set) = self.failing_lessons.lock() {
            set.insert(title.into());
        }
    }

    pub fn outline_calls(&self) -> usize {
        self.outline_calls.load(Ordering::SeqCst)
    }

    pub fn lesson_calls(&self) -> usize {
        self.lesson_calls.load(Ordering::SeqCst)
    }

    pub fn component_calls(&self) -> usize {
        self.component_calls.load(Ordering::SeqCst)
    }

    pub fn ingest_calls(&self) -> usize {
        self.ingest_calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<GenerationError> {
        if let Some(err) = self.always.lock().ok().and_then(|a| a.clone()) {
            return Some(err);
        }
        self.queued_failures.lock().ok().and_then(|mut q| q.pop_front())
    }

    async fn step(
        &self,
        checkpoint: &dyn Checkpoint,
        percent: i32,
        message: &str,
    ) -> Result<(), GenerationError> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        checkpoint.progress(percent, message).await
    }
}

#[async_trait]
impl OutlineGenerator for FakeGenerator {
    async fn generate_outline(
        &self,
        request: &OutlinePayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<OutlineDraft>, GenerationError> {
        self.outline_calls.fetch_add(1, Ordering::SeqCst);
        self.step(checkpoint, 20, "Analyzing knowledge sources").await?;
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        self.step(checkpoint, 60, "Drafting sections").await?;

        let total = request.lesson_count_hint.unwrap_or(DEFAULT_LESSON_COUNT).max(1);
        let audience = request
            .target_audiences
            .first()
            .cloned()
            .unwrap_or_default();
        let first_half = total.div_ceil(2);
        let mut sections = vec![SectionDraft {
            title: "Foundations".into(),
            description: format!("Core concepts for {audience}"),
            lessons: Vec::new(),
        }];
        if total > first_half {
            sections.push(SectionDraft {
                title: "Applying it".into(),
                description: request.desired_outcomes.clone(),
                lessons: Vec::new(),
            });
        }
        for n in 1..=total {
            let idx = if n <= first_half { 0 } else { 1 };
            sections[idx].lessons.push(LessonOutlineDraft {
                title: format!("Lesson {n}"),
                description: format!("Lesson {n} for {audience}"),
                estimated_duration_minutes: 10 + 5 * n,
                learning_objectives: vec![format!("Objective {n}")],
            });
        }
        if let Some(guidance) = &request.guidance {
            sections[0].description = format!("{} (revised: {guidance})", sections[0].description);
        }

        self.step(checkpoint, 90, "Structuring outline").await?;
        Ok(Generated::new(OutlineDraft { sections }, TOKENS_PER_CALL))
    }
}

#[async_trait]
impl LessonGenerator for FakeGenerator {
    async fn generate_lesson(
        &self,
        request: &LessonRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<LessonDraft>, GenerationError> {
        self.lesson_calls.fetch_add(1, Ordering::SeqCst);
        self.step(checkpoint, 30, "Drafting lesson").await?;
        let fails = self
            .failing_lessons
            .lock()
            .map(|set| set.contains(&request.lesson.title))
            .unwrap_or(false);
        if fails {
            return Err(GenerationError::Permanent(format!(
                "content policy rejected {}",
                request.lesson.title
            )));
        }
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        let title = request.lesson.title.clone();
        let segue_text = match &request.previous_title {
            Some(prev) => format!("Building on {prev}, we turn to {title}."),
            None => format!("We begin with {title}."),
        };
        let alignment = Alignment {
            personas: vec![],
            objectives: request.lesson.learning_objectives.clone(),
            kpis: vec![],
        };
        let components = vec![
            ComponentDraft {
                component_type: ComponentType::Heading,
                content_json: json!({ "text": title }),
                alignment: None,
            },
            ComponentDraft {
                component_type: ComponentType::Text,
                content_json: json!({ "text": request.lesson.description }),
                alignment: Some(alignment),
            },
            ComponentDraft {
                component_type: ComponentType::Quiz,
                content_json: json!({
                    "question": format!("What did {title} cover?"),
                    "options": [request.lesson.description, "Something else"],
                    "answer": 0,
                }),
                alignment: None,
            },
        ];
        self.step(checkpoint, 90, "Assembling components").await?;
        Ok(Generated::new(
            LessonDraft {
                title,
                segue_text,
                components,
            },
            TOKENS_PER_CALL,
        ))
    }

    async fn regenerate_component(
        &self,
        request: &ComponentRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<Value>, GenerationError> {
        self.component_calls.fetch_add(1, Ordering::SeqCst);
        self.step(checkpoint, 50, "Regenerating component").await?;
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(Generated::new(
            json!({ "text": format!("{} ({})", request.lesson.title, request.prompt) }),
            TOKENS_PER_CALL / 2,
        ))
    }
}

#[async_trait]
impl SourceIngestor for FakeGenerator {
    async fn ingest(
        &self,
        request: &SmeIngestionPayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<IngestionSummary>, GenerationError> {
        self.ingest_calls.fetch_add(1, Ordering::SeqCst);
        self.step(checkpoint, 40, "Fetching source material").await?;
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        let documents = request.source_uris.len() as u32;
        self.step(checkpoint, 90, "Indexing knowledge").await?;
        Ok(Generated::new(
            IngestionSummary {
                documents,
                chunks: documents * 8,
            },
            TOKENS_PER_CALL,
        ))
    }
}
