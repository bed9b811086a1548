//! Test doubles for the collaborator traits, plus database and app fixtures.

use crate::app::{App, Collaborators};
use crate::config::{Settings, VectorBackend};
use crate::database;
use crate::error::AppError;
use crate::models::{MessageEvent, ThreadMessage};
use crate::oracles::memory::MemoryIndex;
use crate::oracles::traits::{
    Embedder, Generator, IndexEntry, IndexHit, MessageSource, MetadataFilter, VectorIndex,
};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Semaphore;

// ============================================================================
// Embedding
// ============================================================================

pub const FAKE_DIMENSION: usize = 1024;

/// Bag-of-words embedder: each lower-cased word bumps one hashed bucket.
///
/// Texts sharing words land close together, which is all retrieval tests need.
#[derive(Default)]
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
}

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf29ce484222325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x100000001b3)
    })
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; FAKE_DIMENSION];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        vector[(fnv1a(word) % FAKE_DIMENSION as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(bag_of_words(text))
    }

    fn dimension(&self) -> usize {
        FAKE_DIMENSION
    }
}

// ============================================================================
// Generation
// ============================================================================

type ReplyFn = Box<dyn Fn(&str, &str) -> Result<String, AppError> + Send + Sync>;

/// Generator whose reply is computed from the (system, user) prompt pair.
pub struct ScriptedGenerator {
    reply: ReplyFn,
    pub calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String, AppError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers analysis prompts with `analysis` and everything else with `answer`.
    pub fn analysing(analysis: &str, answer: &str) -> Self {
        let analysis = analysis.to_string();
        let answer = answer.to_string();
        Self::new(move |_, user| {
            if user.contains("ERROR_SUMMARY:") {
                Ok(analysis.clone())
            } else {
                Ok(answer.clone())
            }
        })
    }

    pub fn failing() -> Self {
        Self::new(|_, _| Err(AppError::Oracle("generator offline".to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(system_prompt, user_prompt)
    }
}

// ============================================================================
// Message source
// ============================================================================

/// Serves canned threads. Threads can be made to fail, and fetches can be held
/// at a gate until the test releases them.
#[derive(Default)]
pub struct StaticThreadSource {
    threads: Mutex<HashMap<(String, String), Vec<ThreadMessage>>>,
    failing: Mutex<HashSet<(String, String)>>,
    gate: Option<Semaphore>,
    pub fetches: AtomicUsize,
}

impl StaticThreadSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch waits for a permit from [`StaticThreadSource::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn insert(&self, channel_id: &str, thread_id: &str, messages: Vec<ThreadMessage>) {
        self.threads
            .lock()
            .unwrap()
            .insert((channel_id.to_string(), thread_id.to_string()), messages);
    }

    pub fn fail(&self, channel_id: &str, thread_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((channel_id.to_string(), thread_id.to_string()));
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for StaticThreadSource {
    async fn fetch_thread(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?
                .forget();
        }

        let key = (channel_id.to_string(), thread_id.to_string());
        if self.failing.lock().unwrap().contains(&key) {
            return Err(AppError::MessageSource("thread unavailable".to_string()));
        }
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Vector index
// ============================================================================

/// In-memory index whose `add` can be switched to fail.
#[derive(Default)]
pub struct FlakyIndex {
    inner: MemoryIndex,
    pub fail_adds: AtomicBool,
}

impl FlakyIndex {
    pub fn failing() -> Self {
        Self {
            inner: MemoryIndex::new(),
            fail_adds: AtomicBool::new(true),
        }
    }

    pub fn heal(&self) {
        self.fail_adds.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn add(&self, entry: IndexEntry) -> Result<(), AppError> {
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(AppError::VectorIndex("index unavailable".to_string()));
        }
        self.inner.add(entry).await
    }

    async fn update(&self, entry: IndexEntry) -> Result<(), AppError> {
        self.inner.update(entry).await
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.inner.delete(id).await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, AppError> {
        self.inner.query(vector, k, filter).await
    }

    async fn count(&self) -> Result<usize, AppError> {
        self.inner.count().await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A migrated SQLite database that lives as long as this value.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("test.sqlite").display());
    let pool = database::init_db(&url)
        .await
        .expect("Failed to initialise test database");
    TestDb { pool, _dir: dir }
}

/// Settings for in-process tests: memory index, timers far in the future.
pub fn test_settings() -> Settings {
    Settings {
        vector_backend: VectorBackend::Memory,
        embedding_dimension: FAKE_DIMENSION,
        slack_workspace_url: Some("https://acme.slack.com".to_string()),
        poll_interval_secs: 3600,
        cleanup_interval_secs: 86_400,
        learning_delay_hours: 12,
        learning_concurrency: 2,
        similarity_threshold: 0.5,
        answer_similarity_threshold: 0.4,
        ..Settings::default()
    }
}

pub fn collaborators(
    generator: Arc<dyn Generator>,
    source: Arc<dyn MessageSource>,
    index: Arc<dyn VectorIndex>,
) -> Collaborators {
    Collaborators {
        embedder: Arc::new(FakeEmbedder::default()),
        generator,
        index,
        source,
    }
}

/// A started app over a fresh database and an empty memory index.
pub async fn start_app(
    settings: &Settings,
    generator: Arc<dyn Generator>,
    source: Arc<dyn MessageSource>,
) -> (App, TestDb) {
    let db = test_db().await;
    let app = App::start(
        settings,
        db.pool.clone(),
        collaborators(generator, source, Arc::new(MemoryIndex::new())),
    )
    .await
    .expect("Failed to start app");
    (app, db)
}

// ============================================================================
// Builders
// ============================================================================

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn message(author_id: &str, text: &str, timestamp: i64) -> ThreadMessage {
    ThreadMessage {
        author_id: author_id.to_string(),
        text: text.to_string(),
        timestamp,
    }
}

/// A thread root when `thread_id` is `None`.
pub fn event(
    channel_id: &str,
    thread_id: Option<&str>,
    message_id: &str,
    author_id: &str,
    text: &str,
    timestamp: i64,
) -> MessageEvent {
    MessageEvent {
        channel_id: channel_id.to_string(),
        thread_id: thread_id.map(String::from),
        message_id: message_id.to_string(),
        author_id: author_id.to_string(),
        text: text.to_string(),
        timestamp,
    }
}

pub const JAM_ANALYSIS: &str = "ERROR_SUMMARY: Paper jam at the infeed\n\
ROOT_CAUSE: Conveyor speed too high\n\
SOLUTION: Lower the conveyor speed\n\
MACHINE_TYPE: A1100\n\
CATEGORY: none\n\
SUCCESSFUL: yes";

/// A two-person jam thread on an A1100, resolved by `U2`.
pub fn jam_thread(started_at: i64) -> Vec<ThreadMessage> {
    vec![
        message("U1", "A1100 paper jam at the infeed again", started_at),
        message("U2", "Check the conveyor speed", started_at + 60),
        message("U1", "It is set to maximum", started_at + 120),
        message("U2", "Lower the conveyor speed", started_at + 180),
        message("U2", "That fixes it", started_at + 240),
    ]
}
