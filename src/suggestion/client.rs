use crate::suggestion::SuggestionService;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SuggestResponse {
    emoji: Option<String>,
}

/// Calls a remote suggestion endpoint: `POST {"text": ..}` answered with
/// `{"emoji": ..}`.
#[derive(Debug, Clone)]
pub struct HttpSuggestionService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSuggestionService {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl SuggestionService for HttpSuggestionService {
    async fn suggest(&self, text: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .context("Suggestion request failed")?
            .error_for_status()
            .context("Suggestion service returned an error")?;

        let body: SuggestResponse = response
            .json()
            .await
            .context("Malformed suggestion response")?;

        parse_emoji(body)
    }
}

fn parse_emoji(body: SuggestResponse) -> Result<String> {
    match body.emoji.map(|e| e.trim().to_string()) {
        Some(emoji) if !emoji.is_empty() => Ok(emoji),
        _ => bail!("Suggestion service returned no emoji"),
    }
}
