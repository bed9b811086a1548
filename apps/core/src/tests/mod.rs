//! Test Module
//!
//! ## Test Categories
//! - `database_tests`: persistence queries for conversations, solutions, experts, patterns
//! - `tracker_tests`: conversation deadlines and merge rules
//! - `brain_tests`: analysis parsing and solution extraction on realistic threads
//! - `scheduler_tests`: learning batches, single-flight polling, forced processing
//! - `retrieval_tests`: vector retrieval, answers, suggestions and expert routing
//! - `integration_tests`: full flows through the assembled app
//!
//! Shared fixtures live in `fakes`.

pub mod fakes;

mod retrieval_tests;
mod scheduler_tests;
