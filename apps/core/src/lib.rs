//! Threadwise: a support knowledge base that learns from chat threads.
//!
//! Threads are tracked as messages arrive. Once a thread has gone quiet, the
//! scheduler has it analysed and stores the fix as a searchable solution. New
//! error reports and direct questions are answered from those solutions.

pub mod actors;
pub mod app;
pub mod brain;
pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod oracles;
pub mod services;
pub mod slack;
pub mod telemetry;

#[cfg(test)]
mod tests;
