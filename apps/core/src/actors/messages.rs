use crate::error::AppError;
use crate::models::Solution;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Tally of one poll of due conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    /// The poll was coalesced into one already running.
    pub skipped: bool,
    pub selected: usize,
    pub extracted: usize,
    pub unresolved: usize,
    pub already_processed: usize,
    /// Units that hit a transient error and stay eligible.
    pub failed: usize,
    /// Units not started because shutdown began.
    pub cancelled: usize,
}

impl PollReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Messages that can be sent to the `SchedulerActor`.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Run the due-conversation poll now instead of waiting for the next tick.
    PollNow {
        responder: oneshot::Sender<PollReport>,
    },
    /// Extract one named thread immediately, ignoring its deadline.
    ForceProcess {
        channel_id: String,
        thread_id: String,
        responder: oneshot::Sender<Result<Option<Solution>, AppError>>,
    },
    /// Stop ticking, let in-flight units finish, then answer.
    Shutdown { responder: oneshot::Sender<()> },
}
