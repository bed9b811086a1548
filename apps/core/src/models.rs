use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::error::AppError;

/// How urgently an error report needs attention.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Severity {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" => Ok(Severity::Info),
            other => Err(AppError::Validation(format!("Unknown severity: {}", other))),
        }
    }
}

// --- Merge rules ---

/// Error flags only ever turn on.
pub fn merge_error_flag(current: bool, candidate: bool) -> bool {
    current || candidate
}

/// Adds `item` to a set-like list unless already present. Returns whether it was added.
pub fn union_into(set: &mut Vec<String>, item: &str) -> bool {
    let item = item.trim();
    if item.is_empty() || set.iter().any(|existing| existing == item) {
        return false;
    }
    set.push(item.to_string());
    true
}

/// Overwrites `slot` only when a new value is supplied.
pub fn merge_supplied<T>(slot: &mut Option<T>, supplied: Option<T>) {
    if supplied.is_some() {
        *slot = supplied;
    }
}

/// What the tracker learns from one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageObservation {
    /// Unix seconds of the message.
    pub message_time: i64,
    pub is_candidate_error: bool,
    pub detected_pattern: Option<String>,
    pub severity: Option<Severity>,
}

/// Lifecycle record for one (channel, thread) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    /// The unique identifier for the record (UUID).
    pub id: String,
    pub channel_id: String,
    /// Timestamp id of the thread's root message.
    pub thread_id: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub message_count: i64,
    /// Once true, never reset.
    pub is_error_thread: bool,
    pub detected_pattern: Option<String>,
    pub severity: Option<Severity>,
    /// The thread becomes eligible for extraction after this instant.
    pub process_after: i64,
    pub is_processed: bool,
    /// Set only once processed.
    pub is_resolved: Option<bool>,
    pub processed_at: Option<i64>,
    pub extracted_solution_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    /// Builds the record for the first message seen on a thread.
    pub fn first(
        channel_id: &str,
        thread_id: &str,
        observation: MessageObservation,
        delay_secs: i64,
        now: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            thread_id: thread_id.to_string(),
            first_seen_at: observation.message_time,
            last_seen_at: observation.message_time,
            message_count: 1,
            is_error_thread: observation.is_candidate_error,
            detected_pattern: observation.detected_pattern,
            severity: observation.severity,
            process_after: observation.message_time + delay_secs,
            is_processed: false,
            is_resolved: None,
            processed_at: None,
            extracted_solution_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Folds a later message into the record.
    ///
    /// The deadline moves with every message until the thread is processed; a
    /// processed thread keeps its deadline and is never reopened.
    pub fn observe(&mut self, observation: MessageObservation, delay_secs: i64, now: i64) {
        self.last_seen_at = observation.message_time;
        self.message_count += 1;
        self.is_error_thread =
            merge_error_flag(self.is_error_thread, observation.is_candidate_error);
        merge_supplied(&mut self.detected_pattern, observation.detected_pattern);
        merge_supplied(&mut self.severity, observation.severity);
        if !self.is_processed {
            self.process_after = observation.message_time + delay_secs;
        }
        self.updated_at = now;
    }

    pub fn is_due(&self, now: i64) -> bool {
        !self.is_processed && self.is_error_thread && self.process_after <= now
    }
}

/// A learned error/remedy pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Solution {
    /// The unique identifier for the solution (UUID).
    pub id: String,
    pub error_pattern: String,
    pub category: Option<String>,
    pub keywords: Json<Vec<String>>,
    pub summary: String,
    pub full_text: String,
    /// Ordered remediation steps, when the solution text had a list.
    pub steps: Option<Json<Vec<String>>>,
    pub root_cause: Option<String>,
    pub source_channel_id: Option<String>,
    pub source_thread_id: Option<String>,
    pub source_link: Option<String>,
    /// User id of whoever resolved the thread.
    pub created_by: Option<String>,
    pub machine_type: Option<String>,
    pub verified: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Solution {
    /// Share of positive feedback; 0 when nobody has rated it yet.
    pub fn success_rate(&self) -> f64 {
        success_rate(self.success_count, self.failure_count)
    }
}

pub fn success_rate(success_count: i64, failure_count: i64) -> f64 {
    let total = success_count + failure_count;
    if total <= 0 {
        0.0
    } else {
        success_count as f64 / total as f64
    }
}

/// Input for creating a [`Solution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewSolution {
    #[validate(length(min = 1))]
    pub error_pattern: String,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    #[validate(length(min = 1))]
    pub summary: String,
    #[validate(length(min = 1))]
    pub full_text: String,
    pub steps: Option<Vec<String>>,
    pub root_cause: Option<String>,
    pub source_channel_id: Option<String>,
    pub source_thread_id: Option<String>,
    pub source_link: Option<String>,
    pub created_by: Option<String>,
    pub machine_type: Option<String>,
}

/// A person who answers support threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Expert {
    /// Chat-platform user id.
    pub user_id: String,
    pub display_name: Option<String>,
    /// Categories this person has solved. Grows by union only.
    pub expertise_areas: Json<Vec<String>>,
    /// Machines this person has solved. Grows by union only.
    pub machine_types: Json<Vec<String>>,
    pub response_count: i64,
    pub solution_count: i64,
    pub is_available: bool,
    pub last_active_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Expert {
    pub fn new(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            expertise_areas: Json(Vec::new()),
            machine_types: Json(Vec::new()),
            response_count: 0,
            solution_count: 0,
            is_available: true,
            last_active_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits a newly extracted solution to this person.
    pub fn absorb_solution(&mut self, category: Option<&str>, machine_type: Option<&str>, now: i64) {
        if let Some(category) = category {
            union_into(&mut self.expertise_areas.0, category);
        }
        if let Some(machine_type) = machine_type {
            union_into(&mut self.machine_types.0, machine_type);
        }
        self.solution_count += 1;
        self.last_active_at = Some(now);
        self.updated_at = now;
    }

    pub fn handles_machine(&self, machine_type: &str) -> bool {
        self.machine_types.0.iter().any(|m| m == machine_type)
    }

    pub fn handles_category(&self, category: &str) -> bool {
        self.expertise_areas.0.iter().any(|c| c == category)
    }
}

/// A user's verdict on a suggested solution. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Feedback {
    pub id: String,
    pub solution_id: String,
    pub user_id: String,
    pub was_helpful: bool,
    pub feedback_text: Option<String>,
    pub rating: Option<i64>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NewFeedback {
    #[validate(length(min = 1))]
    pub solution_id: String,
    #[validate(length(min = 1))]
    pub user_id: String,
    pub was_helpful: bool,
    #[validate(range(min = 1, max = 5))]
    pub rating: Option<i64>,
    #[validate(length(max = 2000))]
    pub feedback_text: Option<String>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FeedbackStats {
    pub total: i64,
    pub helpful: i64,
    pub avg_rating: Option<f64>,
}

/// A pre-seeded matcher that flags messages as error reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ErrorPattern {
    pub id: String,
    pub name: String,
    pub pattern_regex: Option<String>,
    pub pattern_keywords: Json<Vec<String>>,
    pub category: Option<String>,
    pub severity: Severity,
    /// Higher wins when several patterns match.
    pub priority: i64,
    pub auto_suggest: bool,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

// --- Chat-side shapes ---

/// A message as pushed by the chat platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub channel_id: String,
    /// Root timestamp when the message is a reply; absent on thread roots.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub message_id: String,
    pub author_id: String,
    pub text: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl MessageEvent {
    /// Thread key: the root's id, which is the message's own id on a root.
    pub fn thread_key(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.message_id)
    }

    pub fn is_reply(&self) -> bool {
        matches!(&self.thread_id, Some(root) if root != &self.message_id)
    }
}

/// One message of a fetched thread, in posting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub author_id: String,
    pub text: String,
    pub timestamp: i64,
}

/// Metadata stored next to every vector so hits can be shown without a database trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SolutionMetadata {
    pub error_pattern: String,
    pub solution_preview: String,
    pub category: Option<String>,
    pub machine_type: Option<String>,
    pub success_rate: f64,
}
