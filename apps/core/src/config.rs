//! Process configuration loaded from the environment.
//!
//! `dotenv` is applied by the binary before [`Settings::from_env`] runs, so a
//! local `.env` file and real environment variables are read the same way.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Lance,
    Memory,
}

impl FromStr for VectorBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lance" | "lancedb" => Ok(VectorBackend::Lance),
            "memory" => Ok(VectorBackend::Memory),
            other => Err(AppError::Config(format!("Unknown vector backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// In-process fastembed model.
    Local,
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    Http,
}

impl FromStr for EmbeddingProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "fastembed" => Ok(EmbeddingProvider::Local),
            "http" | "openai" => Ok(EmbeddingProvider::Http),
            other => Err(AppError::Config(format!(
                "Unknown embedding provider: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(AppError::Config(format!("Unknown log format: {}", other))),
        }
    }
}

/// Every tunable of the service. Only the external endpoints lack defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Settings {
    pub database_url: String,
    pub vector_backend: VectorBackend,
    pub vector_db_path: PathBuf,
    pub vector_table: String,

    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub embedding_api_url: Option<String>,
    pub embedding_api_key: Option<String>,
    #[validate(range(min = 1))]
    pub embedding_dimension: usize,

    pub generation_api_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub generation_model: String,
    #[validate(range(min = 0.0, max = 2.0))]
    pub generation_temperature: f32,
    #[validate(range(min = 1))]
    pub generation_max_tokens: u32,
    #[validate(range(min = 1))]
    pub oracle_timeout_secs: u64,

    pub slack_api_url: String,
    pub slack_bot_token: Option<String>,
    pub slack_workspace_url: Option<String>,
    /// Channels whose messages are tracked. Empty means every channel.
    pub monitor_channels: Vec<String>,

    #[validate(range(min = 0))]
    pub learning_delay_hours: i64,
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,
    #[validate(range(min = 1))]
    pub learning_batch_size: i64,
    #[validate(range(min = 1))]
    pub learning_concurrency: usize,

    #[validate(range(min = 0.0, max = 1.0))]
    pub similarity_threshold: f32,
    /// Floor for direct questions, looser than the proactive one.
    #[validate(range(min = 0.0, max = 1.0))]
    pub answer_similarity_threshold: f32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub context_threshold_ratio: f32,
    #[validate(range(min = 1))]
    pub max_search_results: usize,
    pub proactive_support_enabled: bool,

    #[validate(range(min = 1))]
    pub stale_conversation_days: i64,
    #[validate(range(min = 1))]
    pub cleanup_interval_secs: u64,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/threadwise.sqlite".to_string(),
            vector_backend: VectorBackend::Lance,
            vector_db_path: PathBuf::from("data/vectors"),
            vector_table: "solutions".to_string(),
            embedding_provider: EmbeddingProvider::Local,
            embedding_model: "multilingual-e5-small".to_string(),
            embedding_api_url: None,
            embedding_api_key: None,
            embedding_dimension: 384,
            generation_api_url: None,
            generation_api_key: None,
            generation_model: "gpt-4o-mini".to_string(),
            generation_temperature: 0.3,
            generation_max_tokens: 1500,
            oracle_timeout_secs: 60,
            slack_api_url: "https://slack.com/api".to_string(),
            slack_bot_token: None,
            slack_workspace_url: None,
            monitor_channels: Vec::new(),
            learning_delay_hours: 12,
            poll_interval_secs: 3600,
            learning_batch_size: 50,
            learning_concurrency: 4,
            similarity_threshold: 0.75,
            answer_similarity_threshold: 0.5,
            context_threshold_ratio: 0.8,
            max_search_results: 3,
            proactive_support_enabled: true,
            stale_conversation_days: 30,
            cleanup_interval_secs: 86_400,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl Settings {
    /// Reads every key from the environment, falling back to defaults, then validates.
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Settings::default();

        let settings = Settings {
            database_url: env_or("DATABASE_URL", defaults.database_url)?,
            vector_backend: env_or("VECTOR_BACKEND", defaults.vector_backend)?,
            vector_db_path: env_or("VECTOR_DB_PATH", defaults.vector_db_path)?,
            vector_table: env_or("VECTOR_TABLE", defaults.vector_table)?,
            embedding_provider: env_or("EMBEDDING_PROVIDER", defaults.embedding_provider)?,
            embedding_model: env_or("EMBEDDING_MODEL", defaults.embedding_model)?,
            embedding_api_url: env_opt("EMBEDDING_API_URL"),
            embedding_api_key: env_opt("EMBEDDING_API_KEY"),
            embedding_dimension: env_or("EMBEDDING_DIMENSION", defaults.embedding_dimension)?,
            generation_api_url: env_opt("GENERATION_API_URL"),
            generation_api_key: env_opt("GENERATION_API_KEY"),
            generation_model: env_or("GENERATION_MODEL", defaults.generation_model)?,
            generation_temperature: env_or(
                "GENERATION_TEMPERATURE",
                defaults.generation_temperature,
            )?,
            generation_max_tokens: env_or("GENERATION_MAX_TOKENS", defaults.generation_max_tokens)?,
            oracle_timeout_secs: env_or("ORACLE_TIMEOUT_SECS", defaults.oracle_timeout_secs)?,
            slack_api_url: env_or("SLACK_API_URL", defaults.slack_api_url)?,
            slack_bot_token: env_opt("SLACK_BOT_TOKEN"),
            slack_workspace_url: env_opt("SLACK_WORKSPACE_URL"),
            monitor_channels: env_opt("MONITOR_CHANNELS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            learning_delay_hours: env_or("LEARNING_DELAY_HOURS", defaults.learning_delay_hours)?,
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", defaults.poll_interval_secs)?,
            learning_batch_size: env_or("LEARNING_BATCH_SIZE", defaults.learning_batch_size)?,
            learning_concurrency: env_or("LEARNING_CONCURRENCY", defaults.learning_concurrency)?,
            similarity_threshold: env_or("SIMILARITY_THRESHOLD", defaults.similarity_threshold)?,
            answer_similarity_threshold: env_or(
                "ANSWER_SIMILARITY_THRESHOLD",
                defaults.answer_similarity_threshold,
            )?,
            context_threshold_ratio: env_or(
                "CONTEXT_THRESHOLD_RATIO",
                defaults.context_threshold_ratio,
            )?,
            max_search_results: env_or("MAX_SEARCH_RESULTS", defaults.max_search_results)?,
            proactive_support_enabled: env_or(
                "PROACTIVE_SUPPORT_ENABLED",
                defaults.proactive_support_enabled,
            )?,
            stale_conversation_days: env_or(
                "STALE_CONVERSATION_DAYS",
                defaults.stale_conversation_days,
            )?,
            cleanup_interval_secs: env_or("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval_secs)?,
            log_level: env_or("LOG_LEVEL", defaults.log_level)?,
            log_format: env_or("LOG_FORMAT", defaults.log_format)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Fails when an external collaborator the pipeline cannot run without is unset.
    pub fn require_endpoints(&self) -> Result<(), AppError> {
        let generation = self
            .generation_api_url
            .as_deref()
            .ok_or_else(|| AppError::Config("GENERATION_API_URL is required".to_string()))?;
        Url::parse(generation)?;

        if self.embedding_provider == EmbeddingProvider::Http {
            let embedding = self.embedding_api_url.as_deref().ok_or_else(|| {
                AppError::Config(
                    "EMBEDDING_API_URL is required when EMBEDDING_PROVIDER=http".to_string(),
                )
            })?;
            Url::parse(embedding)?;
        }

        if self.slack_bot_token.is_none() {
            return Err(AppError::Config("SLACK_BOT_TOKEN is required".to_string()));
        }
        Url::parse(&self.slack_api_url)?;

        Ok(())
    }

    /// Learning delay expressed in seconds, the unit every stored timestamp uses.
    pub fn learning_delay_secs(&self) -> i64 {
        self.learning_delay_hours * 3600
    }

    pub fn is_monitored(&self, channel_id: &str) -> bool {
        self.monitor_channels.is_empty() || self.monitor_channels.iter().any(|c| c == channel_id)
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| AppError::Config(format!("{} has an invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
