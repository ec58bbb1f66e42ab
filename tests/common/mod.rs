#![allow(dead_code)]

use std::sync::Arc;

use course_forge::db::{self, Pool};
use course_forge::generation::FakeGenerator;
use course_forge::identity::TenantScope;
use course_forge::model::{CourseOutline, GenerationJob, OutlinePayload};
use course_forge::notify::{NotificationHub, Notifier};
use course_forge::orchestrator::Orchestrator;
use course_forge::pipeline::Pipeline;
use course_forge::retry::RetryPolicy;
use course_forge::worker::{Generators, Worker};

pub const MAX_RETRIES: i32 = 3;

pub struct Harness {
    pub pool: Pool,
    pub pipeline: Pipeline,
    pub fake: Arc<FakeGenerator>,
    pub worker: Worker,
    pub scope: TenantScope,
}

pub async fn setup_pool() -> Pool {
    let pool = db::init_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Pipeline over an in-memory store, retrying immediately, with one worker
/// bound to a deterministic generator.
pub async fn harness() -> Harness {
    harness_with(FakeGenerator::new()).await
}

pub async fn harness_with(fake: FakeGenerator) -> Harness {
    harness_with_retry(fake, RetryPolicy::immediate()).await
}

pub async fn harness_with_retry(fake: FakeGenerator, retry: RetryPolicy) -> Harness {
    let pool = setup_pool().await;
    let notifier = Notifier::new(pool.clone(), NotificationHub::new(64));
    let orchestrator = Orchestrator::new(pool.clone(), notifier, retry, MAX_RETRIES);
    let pipeline = Pipeline::new(orchestrator.clone());
    let fake = Arc::new(fake);
    let worker = Worker::new("worker-test", orchestrator, Generators::fake(fake.clone()));
    Harness {
        pool,
        pipeline,
        fake,
        worker,
        scope: TenantScope::new("tenant-a", "user-a"),
    }
}

pub fn outline_input(course_id: &str) -> OutlinePayload {
    OutlinePayload {
        course_id: course_id.to_string(),
        knowledge_source_ids: vec!["ks-1".into(), "ks-2".into()],
        target_audiences: vec!["new managers".into()],
        desired_outcomes: "lead 1:1s ok".into(),
        lesson_count_hint: None,
        guidance: None,
    }
}

impl Harness {
    pub async fn drain(&self) -> usize {
        self.worker.drain().await.unwrap()
    }

    pub async fn job(&self, id: &str) -> GenerationJob {
        self.pipeline.get_job(&self.scope, id).await.unwrap()
    }

    /// Generate and store a pending outline for `course_id`.
    pub async fn pending_outline(&self, course_id: &str) -> CourseOutline {
        self.pipeline
            .generate_outline(&self.scope, outline_input(course_id))
            .await
            .unwrap();
        self.drain().await;
        self.pipeline
            .get_outline(&self.scope, course_id, None)
            .await
            .unwrap()
    }
}
