//! Core domain + application logic for the ollama moderation bot.
//!
//! This crate is transport-agnostic. The chat platform, the `ollama` CLI and the HTTP
//! fetcher live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod log_channel;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod moderation;
pub mod utils;

pub use errors::{Error, Result};
