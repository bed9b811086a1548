use crate::database;
use crate::error::AppError;
use crate::models::{Conversation, MessageObservation};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

type ThreadKey = (String, String);

/// Owns the lifecycle record of every (channel, thread) pair.
///
/// Messages on the same thread are applied one at a time; different threads
/// proceed in parallel.
pub struct ConversationTracker {
    pool: SqlitePool,
    delay_secs: i64,
    locks: Mutex<HashMap<ThreadKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationTracker {
    pub fn new(pool: SqlitePool, delay_secs: i64) -> Self {
        Self {
            pool,
            delay_secs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay_secs(&self) -> i64 {
        self.delay_secs
    }

    fn key_lock(&self, channel_id: &str, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((channel_id.to_string(), thread_id.to_string()))
            .or_default()
            .clone()
    }

    fn release_idle_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Creates or updates the thread's record and pushes its deadline out.
    #[instrument(skip(self, observation), fields(channel_id = %channel_id, thread_id = %thread_id))]
    pub async fn record_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        observation: MessageObservation,
    ) -> Result<Conversation, AppError> {
        let lock = self.key_lock(channel_id, thread_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(channel_id, thread_id, observation).await
        };
        drop(lock);
        self.release_idle_locks();
        result
    }

    async fn apply(
        &self,
        channel_id: &str,
        thread_id: &str,
        observation: MessageObservation,
    ) -> Result<Conversation, AppError> {
        let now = chrono::Utc::now().timestamp();
        let merged = match database::get_conversation(&self.pool, channel_id, thread_id).await? {
            Some(mut existing) => {
                existing.observe(observation, self.delay_secs, now);
                existing
            }
            None => Conversation::first(channel_id, thread_id, observation, self.delay_secs, now),
        };

        let stored = database::upsert_conversation(&self.pool, &merged).await?;
        debug!(
            message_count = stored.message_count,
            is_error_thread = stored.is_error_thread,
            process_after = stored.process_after,
            "Conversation recorded"
        );
        Ok(stored)
    }

    pub async fn get(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        Ok(database::get_conversation(&self.pool, channel_id, thread_id).await?)
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }
}
