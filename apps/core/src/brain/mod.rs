//! # Brain Module
//!
//! Rule-based text understanding for support threads. Nothing here calls an
//! oracle; the generation oracle's reply is parsed here but requested elsewhere.
//!
//! ## Components
//! - `classifier`: flags inbound messages as error reports and grades severity
//! - `analysis`: analysis prompt and parser for the oracle's structured reply
//! - `extractor`: deterministic thread + analysis to solution conversion
//! - `text`: chat-markup cleanup and char-safe truncation

pub mod analysis;
pub mod classifier;
pub mod extractor;
pub mod text;

pub use analysis::ConversationAnalysis;
pub use classifier::{Classification, ErrorClassifier};
pub use extractor::{extract_solution, ExtractedSolution};
