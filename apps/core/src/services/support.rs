use crate::actors::scheduler::SchedulerHandle;
use crate::brain::classifier::{Classification, ErrorClassifier, DEFAULT_PATTERNS};
use crate::brain::extractor::detect_machine_type;
use crate::brain::text::clean_chat_text;
use crate::config::Settings;
use crate::database;
use crate::error::AppError;
use crate::models::{
    Conversation, Expert, Feedback, FeedbackStats, MessageEvent, MessageObservation,
    NewFeedback, NewSolution, Solution,
};
use crate::oracles::traits::MetadataFilter;
use crate::services::experts::{format_expert_suggestion, ExpertRouter};
use crate::services::learning::LearningPipeline;
use crate::services::responder::{Answer, ResponseOrchestrator, Suggestion};
use crate::services::tracker::ConversationTracker;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

const SUGGESTED_EXPERTS: usize = 3;

/// Knobs the facade reads from [`Settings`].
#[derive(Debug, Clone)]
pub struct SupportOptions {
    pub monitor_channels: Vec<String>,
    pub proactive_enabled: bool,
    pub max_search_results: usize,
    pub similarity_threshold: f32,
}

impl SupportOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            monitor_channels: settings.monitor_channels.clone(),
            proactive_enabled: settings.proactive_support_enabled,
            max_search_results: settings.max_search_results,
            similarity_threshold: settings.similarity_threshold,
        }
    }

    fn is_monitored(&self, channel_id: &str) -> bool {
        self.monitor_channels.is_empty() || self.monitor_channels.iter().any(|c| c == channel_id)
    }
}

/// What the service did with a fresh error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProactiveOutcome {
    Suggestion(Suggestion),
    Experts { experts: Vec<String>, message: String },
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageOutcome {
    /// False when the channel is not monitored.
    pub tracked: bool,
    pub conversation: Option<Conversation>,
    pub classification: Classification,
    pub proactive: ProactiveOutcome,
}

impl MessageOutcome {
    fn ignored() -> Self {
        Self {
            tracked: false,
            conversation: None,
            classification: Classification::default(),
            proactive: ProactiveOutcome::Nothing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: Answer,
    /// Present only when no stored solution qualified.
    pub expert_suggestion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub machine_type: Option<String>,
    pub limit: Option<usize>,
    pub min_similarity: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub similarity: f32,
    pub error_pattern: String,
    pub summary: String,
    pub category: Option<String>,
    pub machine_type: Option<String>,
    pub success_rate: f64,
    pub verified: bool,
    pub source_link: Option<String>,
}

/// Canonical form of a solution id; malformed ids are a validation error.
pub fn parse_solution_id(raw: &str) -> Result<String, AppError> {
    Ok(Uuid::parse_str(raw.trim())?.to_string())
}

/// Entry point for the chat layer: message intake, questions, search and feedback.
pub struct SupportService {
    pool: SqlitePool,
    options: SupportOptions,
    classifier: RwLock<ErrorClassifier>,
    tracker: Arc<ConversationTracker>,
    responder: Arc<ResponseOrchestrator>,
    experts: Arc<ExpertRouter>,
    pipeline: Arc<LearningPipeline>,
    scheduler: SchedulerHandle,
}

impl SupportService {
    /// Seeds the default error patterns into an empty table and compiles the active ones.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        pool: SqlitePool,
        options: SupportOptions,
        tracker: Arc<ConversationTracker>,
        responder: Arc<ResponseOrchestrator>,
        experts: Arc<ExpertRouter>,
        pipeline: Arc<LearningPipeline>,
        scheduler: SchedulerHandle,
    ) -> Result<Self, AppError> {
        let now = chrono::Utc::now().timestamp();
        database::seed_error_patterns(&pool, DEFAULT_PATTERNS, now).await?;
        let patterns = database::list_active_error_patterns(&pool).await?;

        Ok(Self {
            pool,
            options,
            classifier: RwLock::new(ErrorClassifier::new(&patterns)),
            tracker,
            responder,
            experts,
            pipeline,
            scheduler,
        })
    }

    /// Recompiles the classifier from the current `error_patterns` rows.
    pub async fn reload_patterns(&self) -> Result<usize, AppError> {
        let patterns = database::list_active_error_patterns(&self.pool).await?;
        let classifier = ErrorClassifier::new(&patterns);
        let count = classifier.len();
        *self.classifier.write().unwrap_or_else(|e| e.into_inner()) = classifier;
        info!(count, "Error patterns reloaded");
        Ok(count)
    }

    pub fn classify(&self, text: &str) -> Classification {
        self.classifier
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .classify(text)
    }

    #[instrument(
        skip(self, event),
        fields(channel_id = %event.channel_id, thread_id = %event.thread_key())
    )]
    pub async fn handle_message(&self, event: &MessageEvent) -> Result<MessageOutcome, AppError> {
        if !self.options.is_monitored(&event.channel_id) {
            debug!("Channel not monitored");
            return Ok(MessageOutcome::ignored());
        }

        let text = clean_chat_text(&event.text);
        let classification = self.classify(&text);

        let conversation = self
            .tracker
            .record_message(
                &event.channel_id,
                event.thread_key(),
                MessageObservation {
                    message_time: event.timestamp,
                    is_candidate_error: classification.is_error,
                    detected_pattern: classification.pattern.clone(),
                    severity: classification.severity,
                },
            )
            .await?;

        if event.is_reply() {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = database::increment_response_count(&self.pool, &event.author_id, now).await
            {
                warn!(error = %e, author_id = %event.author_id, "Could not count expert reply");
            }
        }

        let proactive = if !event.is_reply()
            && classification.is_error
            && classification.auto_suggest
            && self.options.proactive_enabled
        {
            self.proactive(&text, &classification).await
        } else {
            ProactiveOutcome::Nothing
        };

        Ok(MessageOutcome {
            tracked: true,
            conversation: Some(conversation),
            classification,
            proactive,
        })
    }

    async fn proactive(&self, text: &str, classification: &Classification) -> ProactiveOutcome {
        let machine_type = detect_machine_type(text);
        match self.responder.suggest(text, machine_type.as_deref()).await {
            Ok(Some(suggestion)) => return ProactiveOutcome::Suggestion(suggestion),
            Ok(None) => debug!("No solution above the proactive threshold"),
            Err(e) => warn!(error = %e, "Proactive retrieval failed"),
        }

        let experts = match self
            .experts
            .find_experts(
                text,
                machine_type.as_deref(),
                classification.category.as_deref(),
                SUGGESTED_EXPERTS,
            )
            .await
        {
            Ok(experts) => experts,
            Err(e) => {
                warn!(error = %e, "Expert lookup failed");
                return ProactiveOutcome::Nothing;
            }
        };

        match format_expert_suggestion(&experts) {
            Some(message) => ProactiveOutcome::Experts {
                experts: experts.into_iter().map(|e| e.user_id).collect(),
                message,
            },
            None => ProactiveOutcome::Nothing,
        }
    }

    /// Answers a direct question. Without matching solutions, people to ask are appended.
    #[instrument(skip(self, query, context))]
    pub async fn ask(&self, query: &str, context: Option<&str>) -> Result<AskResponse, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::Validation("Question is empty".to_string()));
        }

        let answer = self.responder.answer(query, context).await;
        let expert_suggestion = if answer.has_solutions {
            None
        } else {
            self.experts
                .find_experts(query, None, None, SUGGESTED_EXPERTS)
                .await
                .map(|experts| format_expert_suggestion(&experts))
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Expert lookup failed");
                    None
                })
        };

        Ok(AskResponse {
            answer,
            expert_suggestion,
        })
    }

    /// Ranked solutions for a query. Retrieval outages give an empty list.
    #[instrument(skip(self, query))]
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchHit>, AppError> {
        let limit = filters.limit.unwrap_or(self.options.max_search_results);
        let min_similarity = filters
            .min_similarity
            .unwrap_or(self.options.similarity_threshold);
        let filter = MetadataFilter {
            category: filters.category.clone(),
            machine_type: filters.machine_type.clone(),
        };

        let results = match self
            .responder
            .retrieval()
            .retrieve(query, limit, min_similarity, Some(&filter))
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, "Search degraded to empty result");
                return Ok(Vec::new());
            }
        };

        let ids: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        let rows: HashMap<String, Solution> =
            match database::get_solutions_by_ids(&self.pool, &ids).await {
                Ok(rows) => rows.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(e) => {
                    warn!(error = %e, "Search degraded to empty result");
                    return Ok(Vec::new());
                }
            };

        Ok(results
            .into_iter()
            .map(|result| {
                let row = rows.get(&result.id);
                SearchHit {
                    similarity: result.similarity,
                    error_pattern: result.metadata.error_pattern,
                    summary: row
                        .map(|s| s.summary.clone())
                        .unwrap_or(result.metadata.solution_preview),
                    category: result.metadata.category,
                    machine_type: result.metadata.machine_type,
                    success_rate: row
                        .map(Solution::success_rate)
                        .unwrap_or(result.metadata.success_rate),
                    verified: row.is_some_and(|s| s.verified),
                    source_link: row.and_then(|s| s.source_link.clone()),
                    id: result.id,
                }
            })
            .collect())
    }

    /// Appends feedback and bumps the solution's success or failure counter together.
    #[instrument(skip(self, feedback), fields(solution_id = %feedback.solution_id))]
    pub async fn record_feedback(&self, feedback: NewFeedback) -> Result<Feedback, AppError> {
        feedback.validate()?;
        let feedback = NewFeedback {
            solution_id: parse_solution_id(&feedback.solution_id)?,
            ..feedback
        };

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let counted = database::increment_solution_counter(
            &mut *tx,
            &feedback.solution_id,
            feedback.was_helpful,
            now,
        )
        .await?;
        if !counted {
            tx.rollback().await?;
            return Err(AppError::NotFound(format!(
                "Solution {} not found",
                feedback.solution_id
            )));
        }
        let stored = database::insert_feedback(&mut *tx, &feedback, now).await?;
        tx.commit().await?;

        info!(was_helpful = stored.was_helpful, "Feedback recorded");
        self.refresh_index_entry(&feedback.solution_id).await;
        Ok(stored)
    }

    /// Rewrites the solution's index entry so its stored success rate follows
    /// the counters. A failure leaves the older rate until the next rebuild.
    async fn refresh_index_entry(&self, solution_id: &str) {
        let refreshed = match database::get_solution(&self.pool, solution_id).await {
            Ok(Some(solution)) => self.responder.retrieval().reindex_solution(&solution).await,
            Ok(None) => return,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = refreshed {
            warn!(solution_id = %solution_id, error = %e, "Index entry kept its older success rate");
        }
    }

    pub async fn feedback_stats(&self, solution_id: &str) -> Result<FeedbackStats, AppError> {
        let solution_id = parse_solution_id(solution_id)?;
        Ok(database::feedback_stats(&self.pool, &solution_id).await?)
    }

    pub async fn get_solution(&self, solution_id: &str) -> Result<Option<Solution>, AppError> {
        let solution_id = parse_solution_id(solution_id)?;
        Ok(database::get_solution(&self.pool, &solution_id).await?)
    }

    pub async fn verify_solution(&self, solution_id: &str) -> Result<(), AppError> {
        let solution_id = parse_solution_id(solution_id)?;
        let now = chrono::Utc::now().timestamp();
        if database::set_solution_verified(&self.pool, &solution_id, now).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Solution {} not found", solution_id)))
        }
    }

    /// Adds a hand-written solution to the knowledge base, credited to its author.
    pub async fn add_solution(&self, new: NewSolution) -> Result<Solution, AppError> {
        self.pipeline
            .store_solution(&new, None, new.created_by.as_deref())
            .await?
            .ok_or_else(|| AppError::Internal("Solution was not stored".to_string()))
    }

    pub async fn force_process(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Option<Solution>, AppError> {
        self.scheduler.force_process(channel_id, thread_id).await
    }

    pub async fn find_experts(
        &self,
        query: &str,
        machine_type: Option<&str>,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Expert>, AppError> {
        self.experts
            .find_experts(query, machine_type, category, limit)
            .await
    }

    pub async fn set_expert_availability(
        &self,
        user_id: &str,
        is_available: bool,
    ) -> Result<(), AppError> {
        let now = chrono::Utc::now().timestamp();
        if database::set_expert_availability(&self.pool, user_id, is_available, now).await? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("Expert {} not found", user_id)))
        }
    }

    /// Re-embeds every stored solution into the vector index.
    pub async fn rebuild_index(&self) -> Result<usize, AppError> {
        let solutions = database::list_solutions(&self.pool).await?;
        let retrieval = self.responder.retrieval();
        for solution in &solutions {
            retrieval.reindex_solution(solution).await?;
        }
        info!(count = solutions.len(), "Vector index rebuilt");
        Ok(solutions.len())
    }
}
