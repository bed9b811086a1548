//! The extraction pipeline: fetch a thread, have it analysed, turn the analysis
//! into a solution and persist the outcome.
//!
//! Oracle and fetch failures come back as `Err` and leave the conversation
//! untouched, so it is picked up again on a later poll. Threads that are too
//! short or whose analysis is incomplete are closed as unresolved.

use crate::brain::analysis::{build_analysis_prompt, ConversationAnalysis, ANALYSIS_SYSTEM_PROMPT};
use crate::brain::extractor::{extract_solution, ExtractedSolution};
use crate::database;
use crate::error::AppError;
use crate::models::{Conversation, Expert, MessageObservation, NewSolution, Solution, ThreadMessage};
use crate::oracles::traits::{Generator, MessageSource};
use crate::services::retrieval::RetrievalEngine;
use crate::slack::thread_link;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

const MIN_MESSAGES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "solution", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Extracted(Solution),
    /// Closed without a solution.
    Unresolved,
    /// Someone else closed it first.
    AlreadyProcessed,
}

/// Conversation bookkeeping that must commit together with a new solution.
#[derive(Debug, Clone, Copy)]
pub struct CloseConversation<'a> {
    pub conversation_id: &'a str,
    pub is_resolved: bool,
}

pub struct LearningPipeline {
    pool: SqlitePool,
    source: Arc<dyn MessageSource>,
    generator: Arc<dyn Generator>,
    retrieval: Arc<RetrievalEngine>,
    workspace_url: Option<String>,
}

impl LearningPipeline {
    pub fn new(
        pool: SqlitePool,
        source: Arc<dyn MessageSource>,
        generator: Arc<dyn Generator>,
        retrieval: Arc<RetrievalEngine>,
        workspace_url: Option<String>,
    ) -> Self {
        Self {
            pool,
            source,
            generator,
            retrieval,
            workspace_url,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(
        skip_all,
        fields(
            conversation_id = %conversation.id,
            channel_id = %conversation.channel_id,
            thread_id = %conversation.thread_id
        )
    )]
    pub async fn process(&self, conversation: &Conversation) -> Result<ProcessOutcome, AppError> {
        if conversation.is_processed {
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let messages = self
            .source
            .fetch_thread(&conversation.channel_id, &conversation.thread_id)
            .await?;
        self.learn(conversation, &messages).await
    }

    async fn learn(
        &self,
        conversation: &Conversation,
        messages: &[ThreadMessage],
    ) -> Result<ProcessOutcome, AppError> {
        if messages.len() < MIN_MESSAGES {
            info!(messages = messages.len(), "Thread too short to learn from");
            return self.close_unresolved(conversation).await;
        }

        let reply = self
            .generator
            .generate(ANALYSIS_SYSTEM_PROMPT, &build_analysis_prompt(messages))
            .await?;
        let analysis = ConversationAnalysis::parse(&reply);

        let Some(extracted) = extract_solution(messages, &analysis) else {
            info!("Analysis lacks a fault summary or a remedy");
            return self.close_unresolved(conversation).await;
        };

        let new = self.new_solution(conversation, &extracted);
        let close = CloseConversation {
            conversation_id: &conversation.id,
            is_resolved: extracted.successful,
        };
        match self
            .store_solution(&new, Some(close), extracted.resolver_id.as_deref())
            .await?
        {
            Some(solution) => {
                info!(
                    solution_id = %solution.id,
                    category = ?solution.category,
                    machine_type = ?solution.machine_type,
                    "Solution extracted"
                );
                Ok(ProcessOutcome::Extracted(solution))
            }
            None => Ok(ProcessOutcome::AlreadyProcessed),
        }
    }

    /// Processes one named thread regardless of its deadline or error flag.
    ///
    /// A thread the tracker never saw is fetched and recorded first. An
    /// already processed one gives the solution it produced back then, if any.
    #[instrument(skip(self))]
    pub async fn force_process(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Option<Solution>, AppError> {
        let outcome = match database::get_conversation(&self.pool, channel_id, thread_id).await? {
            Some(conversation) if conversation.is_processed => None,
            Some(conversation) => Some(self.process(&conversation).await?),
            None => {
                let messages = self.source.fetch_thread(channel_id, thread_id).await?;
                let Some(conversation) = self.track_untracked(channel_id, thread_id, &messages).await?
                else {
                    warn!("Force process requested for an empty thread");
                    return Ok(None);
                };
                Some(self.learn(&conversation, &messages).await?)
            }
        };

        match outcome {
            Some(ProcessOutcome::Extracted(solution)) => return Ok(Some(solution)),
            Some(ProcessOutcome::Unresolved) => return Ok(None),
            Some(ProcessOutcome::AlreadyProcessed) | None => {}
        }

        // processed earlier, or concurrently by the timed poll
        let solution_id = database::get_conversation(&self.pool, channel_id, thread_id)
            .await?
            .and_then(|c| c.extracted_solution_id);
        match solution_id {
            Some(id) => Ok(database::get_solution(&self.pool, &id).await?),
            None => Ok(None),
        }
    }

    /// Records a thread the tracker never saw as an error thread spanning the
    /// fetched messages. `None` for an empty thread.
    async fn track_untracked(
        &self,
        channel_id: &str,
        thread_id: &str,
        messages: &[ThreadMessage],
    ) -> Result<Option<Conversation>, AppError> {
        let (Some(first), Some(last)) = (messages.first(), messages.last()) else {
            return Ok(None);
        };
        let now = chrono::Utc::now().timestamp();
        let observation = MessageObservation {
            message_time: first.timestamp,
            is_candidate_error: true,
            detected_pattern: None,
            severity: None,
        };
        let mut conversation = Conversation::first(channel_id, thread_id, observation, 0, now);
        conversation.last_seen_at = last.timestamp;
        conversation.message_count = messages.len() as i64;
        info!(messages = messages.len(), "Recorded untracked thread for forced processing");
        Ok(Some(database::upsert_conversation(&self.pool, &conversation).await?))
    }

    async fn close_unresolved(
        &self,
        conversation: &Conversation,
    ) -> Result<ProcessOutcome, AppError> {
        let now = chrono::Utc::now().timestamp();
        let closed =
            database::mark_conversation_processed(&self.pool, &conversation.id, false, None, now)
                .await?;
        Ok(if closed {
            ProcessOutcome::Unresolved
        } else {
            ProcessOutcome::AlreadyProcessed
        })
    }

    fn new_solution(&self, conversation: &Conversation, extracted: &ExtractedSolution) -> NewSolution {
        NewSolution {
            error_pattern: extracted.error_pattern.clone(),
            category: extracted.category.clone(),
            keywords: extracted.keywords.clone(),
            summary: extracted.summary.clone(),
            full_text: extracted.solution_text.clone(),
            steps: extracted.steps.clone(),
            root_cause: extracted.root_cause.clone(),
            source_channel_id: Some(conversation.channel_id.clone()),
            source_thread_id: Some(conversation.thread_id.clone()),
            source_link: self
                .workspace_url
                .as_deref()
                .map(|url| thread_link(url, &conversation.channel_id, &conversation.thread_id)),
            created_by: extracted.resolver_id.clone(),
            machine_type: extracted.machine_type.clone(),
        }
    }

    /// Writes a solution, its vector, the conversation marker and the resolver's
    /// expert record as one unit.
    ///
    /// Returns `Ok(None)` when `close` names a conversation that is already
    /// processed; nothing is written in that case.
    pub async fn store_solution(
        &self,
        new: &NewSolution,
        close: Option<CloseConversation<'_>>,
        resolver_id: Option<&str>,
    ) -> Result<Option<Solution>, AppError> {
        new.validate()?;
        // embed before the write transaction so the oracle never holds the lock
        let (document, vector) = self
            .retrieval
            .embed_document(&new.error_pattern, &new.full_text)
            .await?;

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let solution = database::insert_solution(&mut *tx, new, now).await?;

        if let Some(close) = close {
            let marked = database::mark_conversation_processed(
                &mut *tx,
                close.conversation_id,
                close.is_resolved,
                Some(&solution.id),
                now,
            )
            .await?;
            if !marked {
                tx.rollback().await?;
                info!(conversation_id = %close.conversation_id, "Conversation already processed");
                return Ok(None);
            }
        }

        if let Some(resolver_id) = resolver_id.filter(|r| !r.is_empty()) {
            let mut expert = database::get_expert(&mut *tx, resolver_id)
                .await?
                .unwrap_or_else(|| Expert::new(resolver_id, now));
            expert.absorb_solution(
                solution.category.as_deref(),
                solution.machine_type.as_deref(),
                now,
            );
            database::save_expert(&mut *tx, &expert).await?;
        }

        // dropping `tx` on error rolls the rows back
        self.retrieval
            .store_embedded(&solution, document, vector)
            .await?;

        if let Err(e) = tx.commit().await {
            if let Err(cleanup) = self.retrieval.remove_solution(&solution.id).await {
                warn!(solution_id = %solution.id, error = %cleanup, "Orphaned vector left in index");
            }
            return Err(e.into());
        }

        Ok(Some(solution))
    }
}
