use crate::models::{
    Conversation, ErrorPattern, Expert, Feedback, FeedbackStats, NewFeedback, NewSolution,
    Severity, Solution,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{Executor, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;

const CONVERSATION_COLUMNS: &str = "id, channel_id, thread_id, first_seen_at, last_seen_at, \
    message_count, is_error_thread, detected_pattern, severity, process_after, is_processed, \
    is_resolved, processed_at, extracted_solution_id, created_at, updated_at";

const SOLUTION_COLUMNS: &str = "id, error_pattern, category, keywords, summary, full_text, steps, \
    root_cause, source_channel_id, source_thread_id, source_link, created_by, machine_type, \
    verified, success_count, failure_count, created_at, updated_at";

const EXPERT_COLUMNS: &str = "user_id, display_name, expertise_areas, machine_types, \
    response_count, solution_count, is_available, last_active_at, created_at, updated_at";

const PATTERN_COLUMNS: &str = "id, name, pattern_regex, pattern_keywords, category, severity, \
    priority, auto_suggest, description, is_active, created_at";

/// Opens the SQLite store and applies pending migrations.
pub async fn init_db(database_url: &str) -> Result<SqlitePool, AppError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!(url = %database_url, "Initializing database");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized and migrations applied");
    Ok(pool)
}

// --- Conversations ---

pub async fn get_conversation(
    pool: &SqlitePool,
    channel_id: &str,
    thread_id: &str,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {} FROM conversations WHERE channel_id = ? AND thread_id = ?",
        CONVERSATION_COLUMNS
    ))
    .bind(channel_id)
    .bind(thread_id)
    .fetch_optional(pool)
    .await
}

/// Writes a tracker-merged conversation.
///
/// Processing columns are never written here, and the deadline is frozen once the
/// row is processed, so a concurrent extraction cannot be undone by a late message.
pub async fn upsert_conversation(
    pool: &SqlitePool,
    conversation: &Conversation,
) -> Result<Conversation, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        r#"
        INSERT INTO conversations (
            id, channel_id, thread_id, first_seen_at, last_seen_at, message_count,
            is_error_thread, detected_pattern, severity, process_after, is_processed,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        ON CONFLICT(channel_id, thread_id) DO UPDATE SET
            last_seen_at = excluded.last_seen_at,
            message_count = excluded.message_count,
            is_error_thread = conversations.is_error_thread OR excluded.is_error_thread,
            detected_pattern = excluded.detected_pattern,
            severity = excluded.severity,
            process_after = CASE
                WHEN conversations.is_processed THEN conversations.process_after
                ELSE excluded.process_after
            END,
            updated_at = excluded.updated_at
        RETURNING {}
        "#,
        CONVERSATION_COLUMNS
    ))
    .bind(&conversation.id)
    .bind(&conversation.channel_id)
    .bind(&conversation.thread_id)
    .bind(conversation.first_seen_at)
    .bind(conversation.last_seen_at)
    .bind(conversation.message_count)
    .bind(conversation.is_error_thread)
    .bind(&conversation.detected_pattern)
    .bind(conversation.severity)
    .bind(conversation.process_after)
    .bind(conversation.created_at)
    .bind(conversation.updated_at)
    .fetch_one(pool)
    .await
}

/// Unprocessed error threads whose quiet period has elapsed, oldest deadline first.
pub async fn list_due_conversations(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(&format!(
        r#"
        SELECT {} FROM conversations
        WHERE is_processed = 0 AND is_error_thread = 1 AND process_after <= ?
        ORDER BY process_after ASC, created_at ASC
        LIMIT ?
        "#,
        CONVERSATION_COLUMNS
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Closes a conversation. Returns false when it had already been processed.
pub async fn mark_conversation_processed<'e, E>(
    executor: E,
    conversation_id: &str,
    is_resolved: bool,
    solution_id: Option<&str>,
    now: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET is_processed = 1, is_resolved = ?, extracted_solution_id = ?, processed_at = ?, updated_at = ?
        WHERE id = ? AND is_processed = 0
        "#,
    )
    .bind(is_resolved)
    .bind(solution_id)
    .bind(now)
    .bind(now)
    .bind(conversation_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drops chatter that never turned into an error thread.
pub async fn delete_stale_conversations(
    pool: &SqlitePool,
    last_seen_before: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM conversations
        WHERE is_processed = 0 AND is_error_thread = 0 AND last_seen_at < ?
        "#,
    )
    .bind(last_seen_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// --- Solutions ---

pub async fn insert_solution<'e, E>(
    executor: E,
    new: &NewSolution,
    now: i64,
) -> Result<Solution, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4().to_string();

    sqlx::query_as::<_, Solution>(&format!(
        r#"
        INSERT INTO solutions (
            id, error_pattern, category, keywords, summary, full_text, steps, root_cause,
            source_channel_id, source_thread_id, source_link, created_by, machine_type,
            verified, success_count, failure_count, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)
        RETURNING {}
        "#,
        SOLUTION_COLUMNS
    ))
    .bind(&id)
    .bind(&new.error_pattern)
    .bind(&new.category)
    .bind(Json(&new.keywords))
    .bind(&new.summary)
    .bind(&new.full_text)
    .bind(new.steps.as_ref().map(Json))
    .bind(&new.root_cause)
    .bind(&new.source_channel_id)
    .bind(&new.source_thread_id)
    .bind(&new.source_link)
    .bind(&new.created_by)
    .bind(&new.machine_type)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
}

pub async fn get_solution(pool: &SqlitePool, id: &str) -> Result<Option<Solution>, sqlx::Error> {
    sqlx::query_as::<_, Solution>(&format!(
        "SELECT {} FROM solutions WHERE id = ?",
        SOLUTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_solutions_by_ids(
    pool: &SqlitePool,
    ids: &[String],
) -> Result<Vec<Solution>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM solutions WHERE id IN ({})",
        SOLUTION_COLUMNS, placeholders
    );

    let mut query = sqlx::query_as::<_, Solution>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query.fetch_all(pool).await
}

/// Every solution, oldest first. Used to rebuild a vector index.
pub async fn list_solutions(pool: &SqlitePool) -> Result<Vec<Solution>, sqlx::Error> {
    sqlx::query_as::<_, Solution>(&format!(
        "SELECT {} FROM solutions ORDER BY created_at ASC, id ASC",
        SOLUTION_COLUMNS
    ))
    .fetch_all(pool)
    .await
}

pub async fn count_solutions(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM solutions")
        .fetch_one(pool)
        .await
}

/// Bumps the success or failure counter. Returns false for an unknown id.
pub async fn increment_solution_counter<'e, E>(
    executor: E,
    solution_id: &str,
    helpful: bool,
    now: i64,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = if helpful {
        "UPDATE solutions SET success_count = success_count + 1, updated_at = ? WHERE id = ?"
    } else {
        "UPDATE solutions SET failure_count = failure_count + 1, updated_at = ? WHERE id = ?"
    };

    let result = sqlx::query(sql)
        .bind(now)
        .bind(solution_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_solution_verified(
    pool: &SqlitePool,
    solution_id: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE solutions SET verified = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(solution_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

// --- Experts ---

pub async fn get_expert<'e, E>(executor: E, user_id: &str) -> Result<Option<Expert>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Expert>(&format!(
        "SELECT {} FROM experts WHERE user_id = ?",
        EXPERT_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Stores a merged expert record in full.
pub async fn save_expert<'e, E>(executor: E, expert: &Expert) -> Result<Expert, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Expert>(&format!(
        r#"
        INSERT INTO experts (
            user_id, display_name, expertise_areas, machine_types, response_count,
            solution_count, is_available, last_active_at, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            display_name = COALESCE(excluded.display_name, experts.display_name),
            expertise_areas = excluded.expertise_areas,
            machine_types = excluded.machine_types,
            response_count = excluded.response_count,
            solution_count = excluded.solution_count,
            is_available = excluded.is_available,
            last_active_at = excluded.last_active_at,
            updated_at = excluded.updated_at
        RETURNING {}
        "#,
        EXPERT_COLUMNS
    ))
    .bind(&expert.user_id)
    .bind(&expert.display_name)
    .bind(&expert.expertise_areas)
    .bind(&expert.machine_types)
    .bind(expert.response_count)
    .bind(expert.solution_count)
    .bind(expert.is_available)
    .bind(expert.last_active_at)
    .bind(expert.created_at)
    .bind(expert.updated_at)
    .fetch_one(executor)
    .await
}

/// Counts a reply by someone already known as an expert. Unknown users are ignored.
pub async fn increment_response_count(
    pool: &SqlitePool,
    user_id: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE experts
        SET response_count = response_count + 1, last_active_at = ?, updated_at = ?
        WHERE user_id = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_expert_availability(
    pool: &SqlitePool,
    user_id: &str,
    is_available: bool,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE experts SET is_available = ?, updated_at = ? WHERE user_id = ?")
            .bind(is_available)
            .bind(now)
            .bind(user_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn available_experts_for_machine(
    pool: &SqlitePool,
    machine_type: &str,
    limit: i64,
) -> Result<Vec<Expert>, sqlx::Error> {
    sqlx::query_as::<_, Expert>(&format!(
        r#"
        SELECT {} FROM experts
        WHERE is_available = 1
          AND EXISTS (SELECT 1 FROM json_each(experts.machine_types) WHERE json_each.value = ?)
        ORDER BY solution_count DESC, user_id ASC
        LIMIT ?
        "#,
        EXPERT_COLUMNS
    ))
    .bind(machine_type)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn available_experts_for_category(
    pool: &SqlitePool,
    category: &str,
    limit: i64,
) -> Result<Vec<Expert>, sqlx::Error> {
    sqlx::query_as::<_, Expert>(&format!(
        r#"
        SELECT {} FROM experts
        WHERE is_available = 1
          AND EXISTS (SELECT 1 FROM json_each(experts.expertise_areas) WHERE json_each.value = ?)
        ORDER BY solution_count DESC, user_id ASC
        LIMIT ?
        "#,
        EXPERT_COLUMNS
    ))
    .bind(category)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn top_experts(pool: &SqlitePool, limit: i64) -> Result<Vec<Expert>, sqlx::Error> {
    sqlx::query_as::<_, Expert>(&format!(
        r#"
        SELECT {} FROM experts
        WHERE is_available = 1
        ORDER BY solution_count DESC, user_id ASC
        LIMIT ?
        "#,
        EXPERT_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

// --- Feedback ---

pub async fn insert_feedback<'e, E>(
    executor: E,
    feedback: &NewFeedback,
    now: i64,
) -> Result<Feedback, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4().to_string();

    sqlx::query_as::<_, Feedback>(
        r#"
        INSERT INTO solution_feedback (
            id, solution_id, user_id, was_helpful, feedback_text, rating, channel_id, thread_id, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id, solution_id, user_id, was_helpful, feedback_text, rating, channel_id, thread_id, created_at
        "#,
    )
    .bind(&id)
    .bind(&feedback.solution_id)
    .bind(&feedback.user_id)
    .bind(feedback.was_helpful)
    .bind(&feedback.feedback_text)
    .bind(feedback.rating)
    .bind(&feedback.channel_id)
    .bind(&feedback.thread_id)
    .bind(now)
    .fetch_one(executor)
    .await
}

pub async fn feedback_stats(
    pool: &SqlitePool,
    solution_id: &str,
) -> Result<FeedbackStats, sqlx::Error> {
    sqlx::query_as::<_, FeedbackStats>(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN was_helpful THEN 1 ELSE 0 END), 0) AS helpful,
            AVG(rating) AS avg_rating
        FROM solution_feedback
        WHERE solution_id = ?
        "#,
    )
    .bind(solution_id)
    .fetch_one(pool)
    .await
}

// --- Error patterns ---

/// Definition used to seed or add a matcher.
#[derive(Debug, Clone)]
pub struct PatternSeed {
    pub name: &'static str,
    pub pattern_regex: Option<&'static str>,
    pub pattern_keywords: &'static [&'static str],
    pub category: Option<&'static str>,
    pub severity: Severity,
    pub priority: i64,
    pub description: &'static str,
}

pub async fn list_active_error_patterns(
    pool: &SqlitePool,
) -> Result<Vec<ErrorPattern>, sqlx::Error> {
    sqlx::query_as::<_, ErrorPattern>(&format!(
        "SELECT {} FROM error_patterns WHERE is_active = 1 ORDER BY priority DESC, name ASC",
        PATTERN_COLUMNS
    ))
    .fetch_all(pool)
    .await
}

pub async fn insert_error_pattern(
    pool: &SqlitePool,
    seed: &PatternSeed,
    now: i64,
) -> Result<ErrorPattern, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let keywords: Vec<String> = seed.pattern_keywords.iter().map(|k| k.to_string()).collect();

    sqlx::query_as::<_, ErrorPattern>(&format!(
        r#"
        INSERT INTO error_patterns (
            id, name, pattern_regex, pattern_keywords, category, severity, priority,
            auto_suggest, description, is_active, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, 1, ?)
        RETURNING {}
        "#,
        PATTERN_COLUMNS
    ))
    .bind(&id)
    .bind(seed.name)
    .bind(seed.pattern_regex)
    .bind(Json(keywords))
    .bind(seed.category)
    .bind(seed.severity)
    .bind(seed.priority)
    .bind(seed.description)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub async fn deactivate_error_pattern(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE error_patterns SET is_active = 0 WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Inserts `seeds` only when the table is empty. Returns how many rows were written.
pub async fn seed_error_patterns(
    pool: &SqlitePool,
    seeds: &[PatternSeed],
    now: i64,
) -> Result<usize, sqlx::Error> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM error_patterns")
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Ok(0);
    }

    for seed in seeds {
        insert_error_pattern(pool, seed, now).await?;
    }
    info!(count = seeds.len(), "Seeded default error patterns");
    Ok(seeds.len())
}
