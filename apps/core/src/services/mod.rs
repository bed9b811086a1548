//! # Services
//!
//! Stateful components built on the database and the oracles.
//!
//! - `tracker`: one record per thread, updated on every message.
//! - `retrieval`: embeds queries and ranks stored solutions.
//! - `responder`: turns retrieved solutions into answers and suggestions.
//! - `experts`: picks people to ask when the knowledge base has nothing.
//! - `learning`: extracts solutions from finished threads.
//! - `support`: the facade the chat layer talks to.

pub mod experts;
pub mod learning;
pub mod responder;
pub mod retrieval;
pub mod support;
pub mod tracker;

pub use experts::ExpertRouter;
pub use learning::{LearningPipeline, ProcessOutcome};
pub use responder::{Answer, ResponseOrchestrator, Suggestion};
pub use retrieval::{RetrievalEngine, RetrievedSolution};
pub use support::{SupportOptions, SupportService};
pub use tracker::ConversationTracker;
