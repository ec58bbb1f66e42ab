use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{Alignment, ComponentType, CourseOutline, GeneratedLesson, LessonComponent};

/// Editable course content handed to the editing surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseContent {
    pub course_id: String,
    pub outline_id: String,
    pub outline_version: i64,
    pub sections: Vec<ContentSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSection {
    pub id: String,
    pub title: String,
    pub description: String,
    pub lessons: Vec<ContentLesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentLesson {
    /// Generated lesson id, or `None` when nothing was generated for it.
    pub lesson_id: Option<String>,
    pub outline_lesson_id: String,
    pub title: String,
    pub segue_text: String,
    pub duration_minutes: u32,
    pub learning_objectives: Vec<String>,
    pub blocks: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: String,
    pub kind: ComponentType,
    pub content: Value,
    pub alignment: Option<Alignment>,
}

impl CourseContent {
    pub fn lesson_count(&self) -> usize {
        self.sections.iter().map(|s| s.lessons.len()).sum()
    }

    pub fn generated_count(&self) -> usize {
        self.sections
            .iter()
            .flat_map(|s| &s.lessons)
            .filter(|l| l.lesson_id.is_some())
            .count()
    }
}

/// Merge an outline with its generated lessons. Structure and order come
/// from the outline; blocks come from the lesson generated for each outline
/// lesson, sorted by component order. Pure: equal inputs give equal output.
pub fn to_course_content(outline: &CourseOutline, lessons: &[GeneratedLesson]) -> CourseContent {
    let by_outline_lesson: HashMap<&str, &GeneratedLesson> = lessons
        .iter()
        .filter(|l| l.outline_id == outline.id)
        .map(|l| (l.outline_lesson_id.as_str(), l))
        .collect();

    let sections = outline
        .sections
        .iter()
        .map(|section| ContentSection {
            id: section.id.clone(),
            title: section.title.clone(),
            description: section.description.clone(),
            lessons: section
                .lessons
                .iter()
                .map(|planned| {
                    let generated = by_outline_lesson.get(planned.id.as_str());
                    let mut components: Vec<&LessonComponent> = generated
                        .map(|g| g.components.iter().collect())
                        .unwrap_or_default();
                    components
                        .sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
                    ContentLesson {
                        lesson_id: generated.map(|g| g.id.clone()),
                        outline_lesson_id: planned.id.clone(),
                        title: generated
                            .map(|g| g.title.clone())
                            .unwrap_or_else(|| planned.title.clone()),
                        segue_text: generated.map(|g| g.segue_text.clone()).unwrap_or_default(),
                        duration_minutes: planned.estimated_duration_minutes,
                        learning_objectives: planned.learning_objectives.clone(),
                        blocks: components
                            .into_iter()
                            .map(|c| ContentBlock {
                                id: c.id.clone(),
                                kind: c.component_type,
                                content: c.content_json.clone(),
                                alignment: c.alignment.clone(),
                            })
                            .collect(),
                    }
                })
                .collect(),
        })
        .collect();

    CourseContent {
        course_id: outline.course_id.clone(),
        outline_id: outline.id.clone(),
        outline_version: outline.version,
        sections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalStatus, OutlineLesson, OutlineSection};
    use chrono::Utc;
    use serde_json::json;

    fn outline() -> CourseOutline {
        let now = Utc::now();
        let lesson = |id: &str, title: &str| OutlineLesson {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            estimated_duration_minutes: 12,
            learning_objectives: vec!["obj".into()],
        };
        CourseOutline {
            id: "o1".into(),
            tenant_id: "t1".into(),
            course_id: "c1".into(),
            version: 2,
            approval_status: ApprovalStatus::Approved,
            sections: vec![OutlineSection {
                id: "s1".into(),
                title: "Basics".into(),
                description: "d".into(),
                lessons: vec![lesson("l1", "One"), lesson("l2", "Two")],
            }],
            rejection_reason: None,
            revision_notes: None,
            source_job_id: None,
            superseded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn generated(outline_lesson_id: &str) -> GeneratedLesson {
        let now = Utc::now();
        let component = |id: &str, order: u32| LessonComponent {
            id: id.into(),
            component_type: ComponentType::Text,
            order,
            content_json: json!({ "text": id }),
            alignment: None,
        };
        GeneratedLesson {
            id: format!("g-{outline_lesson_id}"),
            tenant_id: "t1".into(),
            course_id: "c1".into(),
            outline_id: "o1".into(),
            section_id: "s1".into(),
            outline_lesson_id: outline_lesson_id.into(),
            title: "Generated title".into(),
            segue_text: "segue".into(),
            components: vec![component("b", 1), component("a", 0)],
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn follows_outline_order_and_sorts_blocks() {
        let content = to_course_content(&outline(), &[generated("l2")]);
        assert_eq!(content.outline_version, 2);
        assert_eq!(content.lesson_count(), 2);
        assert_eq!(content.generated_count(), 1);

        let lessons = &content.sections[0].lessons;
        assert_eq!(lessons[0].outline_lesson_id, "l1");
        assert!(lessons[0].blocks.is_empty());
        assert_eq!(lessons[0].title, "One");
        assert_eq!(lessons[1].title, "Generated title");
        let ids: Vec<_> = lessons[1].blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn transformation_is_idempotent() {
        let outline = outline();
        let lessons = vec![generated("l1"), generated("l2")];
        assert_eq!(
            to_course_content(&outline, &lessons),
            to_course_content(&outline, &lessons)
        );
    }
}
