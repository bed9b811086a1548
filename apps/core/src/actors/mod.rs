//! # Actors
//!
//! Long-running tasks reached through a cloneable handle and an `mpsc` mailbox.
//! Each request carries a `oneshot` responder for its reply.
//!
//! - `scheduler`: the learning timer. Polls due conversations, runs cleanup and
//!   serves force-process requests.
//! - `messages`: the mailbox message types and reports.

pub mod messages;
pub mod scheduler;

pub use messages::{PollReport, SchedulerMessage};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SingleFlight};
