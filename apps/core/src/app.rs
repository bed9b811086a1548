//! Wiring: builds the collaborators from [`Settings`], assembles the services,
//! starts the scheduler and routes line commands to the support facade.

use crate::actors::messages::PollReport;
use crate::actors::scheduler::{SchedulerConfig, SchedulerHandle};
use crate::config::{EmbeddingProvider, Settings, VectorBackend};
use crate::database;
use crate::error::AppError;
use crate::models::{Feedback, FeedbackStats, MessageEvent, NewFeedback, NewSolution, Solution};
use crate::oracles::traits::{Embedder, Generator, MessageSource, VectorIndex};
use crate::oracles::{HttpEmbedder, LanceIndex, LocalEmbedder, MemoryIndex, OpenAiGenerator};
use crate::services::experts::ExpertRouter;
use crate::services::learning::LearningPipeline;
use crate::services::responder::ResponseOrchestrator;
use crate::services::retrieval::RetrievalEngine;
use crate::services::support::{
    AskResponse, MessageOutcome, SearchFilters, SearchHit, SupportOptions, SupportService,
};
use crate::services::tracker::ConversationTracker;
use crate::slack::SlackThreadSource;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The external systems every service talks through.
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub index: Arc<dyn VectorIndex>,
    pub source: Arc<dyn MessageSource>,
}

impl Collaborators {
    /// Production collaborators. Call [`Settings::require_endpoints`] first.
    pub async fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let oracle_timeout = Duration::from_secs(settings.oracle_timeout_secs);

        let generation_url = settings
            .generation_api_url
            .as_deref()
            .ok_or_else(|| AppError::Config("GENERATION_API_URL is required".to_string()))?;
        let generator = OpenAiGenerator::new(
            generation_url,
            &settings.generation_model,
            settings.generation_api_key.clone(),
        )
        .with_sampling(settings.generation_temperature, settings.generation_max_tokens)
        .with_timeout(oracle_timeout);

        let embedder: Arc<dyn Embedder> = match settings.embedding_provider {
            EmbeddingProvider::Local => {
                let cache_dir = settings.vector_db_path.with_file_name("models");
                Arc::new(LocalEmbedder::new(&settings.embedding_model, cache_dir)?)
            }
            EmbeddingProvider::Http => {
                let url = settings.embedding_api_url.as_deref().ok_or_else(|| {
                    AppError::Config("EMBEDDING_API_URL is required".to_string())
                })?;
                Arc::new(
                    HttpEmbedder::new(
                        url,
                        &settings.embedding_model,
                        settings.embedding_api_key.clone(),
                        settings.embedding_dimension,
                    )
                    .with_timeout(oracle_timeout),
                )
            }
        };

        let index: Arc<dyn VectorIndex> = match settings.vector_backend {
            VectorBackend::Lance => Arc::new(
                LanceIndex::open(
                    &settings.vector_db_path,
                    &settings.vector_table,
                    embedder.dimension(),
                )
                .await?,
            ),
            VectorBackend::Memory => Arc::new(MemoryIndex::new()),
        };

        let token = settings
            .slack_bot_token
            .as_deref()
            .ok_or_else(|| AppError::Config("SLACK_BOT_TOKEN is required".to_string()))?;
        let source = SlackThreadSource::new(&settings.slack_api_url, token)
            .with_timeout(oracle_timeout);

        Ok(Self {
            embedder,
            generator: Arc::new(generator),
            index,
            source: Arc::new(source),
        })
    }
}

/// A running instance: the support facade plus the scheduler behind it.
pub struct App {
    pub service: Arc<SupportService>,
    pub scheduler: SchedulerHandle,
}

impl App {
    pub async fn start(
        settings: &Settings,
        pool: SqlitePool,
        collaborators: Collaborators,
    ) -> Result<Self, AppError> {
        let retrieval = Arc::new(RetrievalEngine::new(
            collaborators.embedder,
            collaborators.index,
            settings.similarity_threshold,
            settings.context_threshold_ratio,
        ));
        let responder = Arc::new(ResponseOrchestrator::new(
            Arc::clone(&retrieval),
            Arc::clone(&collaborators.generator),
            settings.max_search_results,
            settings.answer_similarity_threshold,
        ));
        let pipeline = Arc::new(LearningPipeline::new(
            pool.clone(),
            collaborators.source,
            collaborators.generator,
            Arc::clone(&retrieval),
            settings.slack_workspace_url.clone(),
        ));
        let tracker = Arc::new(ConversationTracker::new(
            pool.clone(),
            settings.learning_delay_secs(),
        ));
        let experts = Arc::new(ExpertRouter::new(pool.clone()));

        let scheduler =
            SchedulerHandle::spawn(Arc::clone(&pipeline), SchedulerConfig::from_settings(settings));

        let service = SupportService::new(
            pool.clone(),
            SupportOptions::from_settings(settings),
            tracker,
            responder,
            experts,
            pipeline,
            scheduler.clone(),
        )
        .await;
        let service = match service {
            Ok(service) => Arc::new(service),
            Err(e) => {
                let _ = scheduler.shutdown().await;
                return Err(e);
            }
        };

        // an in-memory index starts empty on every run
        let stored = database::count_solutions(&pool).await?;
        if stored > 0 && retrieval.indexed_count().await? == 0 {
            info!(stored, "Vector index empty, rebuilding from stored solutions");
            service.rebuild_index().await?;
        }

        Ok(Self { service, scheduler })
    }

    /// Runs one command. Failures become an [`Reply::Error`] line.
    pub async fn dispatch(&self, command: Command) -> Reply {
        match self.execute(command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Command failed");
                Reply::Error {
                    message: e.to_string(),
                    transient: e.is_transient(),
                }
            }
        }
    }

    async fn execute(&self, command: Command) -> Result<Reply, AppError> {
        let service = &self.service;
        Ok(match command {
            Command::Message(event) => Reply::Message(service.handle_message(&event).await?),
            Command::Ask { query, context } => {
                Reply::Answer(service.ask(&query, context.as_deref()).await?)
            }
            Command::Search { query, filters } => Reply::SearchResults {
                hits: service.search(&query, &filters.unwrap_or_default()).await?,
            },
            Command::Feedback(feedback) => Reply::Feedback(service.record_feedback(feedback).await?),
            Command::FeedbackStats { solution_id } => {
                Reply::FeedbackStats(service.feedback_stats(&solution_id).await?)
            }
            Command::GetSolution { solution_id } => Reply::Solution {
                solution: service.get_solution(&solution_id).await?,
            },
            Command::VerifySolution { solution_id } => {
                service.verify_solution(&solution_id).await?;
                Reply::Done
            }
            Command::AddSolution(new) => Reply::Solution {
                solution: Some(service.add_solution(new).await?),
            },
            Command::ForceProcess {
                channel_id,
                thread_id,
            } => Reply::Solution {
                solution: service.force_process(&channel_id, &thread_id).await?,
            },
            Command::Poll => Reply::Poll(self.scheduler.poll_now().await?),
            Command::ReloadPatterns => Reply::PatternsReloaded {
                count: service.reload_patterns().await?,
            },
        })
    }

    /// Stops the scheduler after its in-flight units finish.
    pub async fn shutdown(self) -> Result<(), AppError> {
        self.scheduler.shutdown().await
    }
}

/// One line of input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Message(MessageEvent),
    Ask {
        query: String,
        #[serde(default)]
        context: Option<String>,
    },
    Search {
        query: String,
        #[serde(default)]
        filters: Option<SearchFilters>,
    },
    Feedback(NewFeedback),
    FeedbackStats {
        solution_id: String,
    },
    GetSolution {
        solution_id: String,
    },
    VerifySolution {
        solution_id: String,
    },
    AddSolution(NewSolution),
    ForceProcess {
        channel_id: String,
        thread_id: String,
    },
    Poll,
    ReloadPatterns,
}

/// One line of output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Message(MessageOutcome),
    Answer(AskResponse),
    SearchResults { hits: Vec<SearchHit> },
    Feedback(Feedback),
    FeedbackStats(FeedbackStats),
    Solution { solution: Option<Solution> },
    Poll(PollReport),
    PatternsReloaded { count: usize },
    Done,
    Error { message: String, transient: bool },
}
