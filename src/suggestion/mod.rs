//! Sentiment-based emoji suggestions for the message draft.

pub mod client;
pub mod pipeline;

use anyhow::Result;
use std::future::Future;

pub use client::HttpSuggestionService;
pub use pipeline::{SuggestionConfig, SuggestionPipeline};

/// Text in, one emoji out. May fail; nothing is persisted.
pub trait SuggestionService: Send + Sync + 'static {
    fn suggest(&self, text: &str) -> impl Future<Output = Result<String>> + Send;
}
