//! db-copilot - natural-language questions over connected databases.
//!
//! The library holds the service core (sessions, connection lifecycle,
//! the chat pipeline and schema analysis), its HTTP surface, and the
//! client SDK a UI uses to talk to it.

pub mod analysis;
pub mod chat;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod query;
pub mod safety;
pub mod server;
pub mod session;
