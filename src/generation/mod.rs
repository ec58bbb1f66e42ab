//! Generation strategies, one trait per pipeline stage.
//!
//! The worker drives each stage through these traits. `provider` talks to the
//! content-generation service over HTTP; `fake` is deterministic and scriptable
//! for tests and local runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    Alignment, ComponentType, GeneratedLesson, LessonComponent, OutlineLesson, OutlinePayload,
    OutlineSection, SmeIngestionPayload,
};

pub mod fake;
pub mod provider;

pub use fake::FakeGenerator;
pub use provider::ProviderClient;

/// Failure reported by a generation strategy. The kind decides whether the
/// job is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("job cancelled")]
    Cancelled,
}

/// Progress sink handed to a running strategy. Reporting fails with
/// `GenerationError::Cancelled` once the job is no longer running, which is
/// the strategy's cue to stop.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn progress(&self, percent: i32, message: &str) -> Result<(), GenerationError>;

    fn is_cancelled(&self) -> bool;
}

/// Output of one strategy call plus the tokens it consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated<T> {
    pub value: T,
    pub tokens_used: i64,
}

impl<T> Generated<T> {
    pub fn new(value: T, tokens_used: i64) -> Self {
        Self { value, tokens_used }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonOutlineDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_duration_minutes: u32,
    #[serde(default)]
    pub learning_objectives: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub lessons: Vec<LessonOutlineDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineDraft {
    pub sections: Vec<SectionDraft>,
}

impl OutlineDraft {
    /// Assign fresh identifiers to every section and lesson.
    pub fn into_sections(self) -> Vec<OutlineSection> {
        self.sections
            .into_iter()
            .map(|section| OutlineSection {
                id: Uuid::new_v4().to_string(),
                title: section.title,
                description: section.description,
                lessons: section
                    .lessons
                    .into_iter()
                    .map(|lesson| OutlineLesson {
                        id: Uuid::new_v4().to_string(),
                        title: lesson.title,
                        description: lesson.description,
                        estimated_duration_minutes: lesson.estimated_duration_minutes,
                        learning_objectives: lesson.learning_objectives,
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDraft {
    pub component_type: ComponentType,
    pub content_json: Value,
    #[serde(default)]
    pub alignment: Option<Alignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDraft {
    pub title: String,
    #[serde(default)]
    pub segue_text: String,
    pub components: Vec<ComponentDraft>,
}

impl LessonDraft {
    /// Components in draft order with fresh ids and dense `order` values.
    pub fn into_components(self) -> Vec<LessonComponent> {
        self.components
            .into_iter()
            .enumerate()
            .map(|(idx, c)| LessonComponent {
                id: Uuid::new_v4().to_string(),
                component_type: c.component_type,
                order: idx as u32,
                content_json: c.content_json,
                alignment: c.alignment,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub documents: u32,
    pub chunks: u32,
}

/// Context for generating one lesson of an approved outline.
#[derive(Debug, Clone)]
pub struct LessonRequest {
    pub course_id: String,
    pub section: OutlineSection,
    pub lesson: OutlineLesson,
    /// Title of the lesson that precedes this one, used for the segue.
    pub previous_title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComponentRequest {
    pub lesson: GeneratedLesson,
    pub component: LessonComponent,
    pub prompt: String,
}

#[async_trait]
pub trait OutlineGenerator: Send + Sync {
    async fn generate_outline(
        &self,
        request: &OutlinePayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<OutlineDraft>, GenerationError>;
}

#[async_trait]
pub trait LessonGenerator: Send + Sync {
    async fn generate_lesson(
        &self,
        request: &LessonRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<LessonDraft>, GenerationError>;

    /// New `content_json` for a single component.
    async fn regenerate_component(
        &self,
        request: &ComponentRequest,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<Value>, GenerationError>;
}

#[async_trait]
pub trait SourceIngestor: Send + Sync {
    async fn ingest(
        &self,
        request: &SmeIngestionPayload,
        checkpoint: &dyn Checkpoint,
    ) -> Result<Generated<IngestionSummary>, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outline_draft_gets_unique_ids() {
        let draft = OutlineDraft {
            sections: vec![SectionDraft {
                title: "Basics".into(),
                description: String::new(),
                lessons: vec![
                    LessonOutlineDraft {
                        title: "One".into(),
                        description: String::new(),
                        estimated_duration_minutes: 10,
                        learning_objectives: vec![],
                    },
                    LessonOutlineDraft {
                        title: "Two".into(),
                        description: String::new(),
                        estimated_duration_minutes: 15,
                        learning_objectives: vec![],
                    },
                ],
            }],
        };
        let sections = draft.into_sections();
        assert_eq!(sections.len(), 1);
        assert_ne!(sections[0].lessons[0].id, sections[0].lessons[1].id);
        assert_eq!(sections[0].lessons[1].estimated_duration_minutes, 15);
    }

    #[test]
    fn lesson_draft_orders_components() {
        let draft = LessonDraft {
            title: "Intro".into(),
            segue_text: String::new(),
            components: vec![
                ComponentDraft {
                    component_type: ComponentType::Heading,
                    content_json: json!({"text": "Intro"}),
                    alignment: None,
                },
                ComponentDraft {
                    component_type: ComponentType::Text,
                    content_json: json!({"text": "Body"}),
                    alignment: None,
                },
            ],
        };
        let components = draft.into_components();
        assert_eq!(components[0].order, 0);
        assert_eq!(components[1].order, 1);
        assert_eq!(components[1].component_type, ComponentType::Text);
    }
}
