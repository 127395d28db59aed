// src/lib.rs
// Memory Weave - persona-scoped hierarchical long-term memory engine

#![allow(clippy::too_many_arguments)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod backup;
pub mod chronicle;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod memopedia;
pub mod messages;
pub mod recall;
pub mod uri;

pub use error::{LlmError, LlmErrorCode, Result, WeaveError};
