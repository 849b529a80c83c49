//! Client configuration loaded from environment variables (and `.env`).

use crate::entity::{User, UserId};
use crate::suggestion::SuggestionConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    /// Env: `RELAY_DB_PATH`
    /// Default: `$HOME/.relay/relay.db`
    pub db_path: PathBuf,

    /// The local user. Env: `RELAY_USER_ID` (required), `RELAY_DISPLAY_NAME`,
    /// `RELAY_EMAIL`
    pub user: User,

    /// Env: `RELAY_SUGGEST_URL`. Suggestions are off when unset.
    pub suggest_url: Option<String>,

    /// Env: `RELAY_SUGGEST_DEBOUNCE_MS`, `RELAY_SUGGEST_MIN_CHARS`
    pub suggestion: SuggestionConfig,

    /// How often feeds and the conversation list re-check the database for
    /// writes from other processes.
    /// Env: `RELAY_POLL_INTERVAL_MS`
    /// Default: `1000`
    pub poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let db_path = match get("RELAY_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home).join(".relay").join("relay.db")
            }
        };

        let uid = get("RELAY_USER_ID").context("RELAY_USER_ID not set")?;
        let uid = UserId::parse(uid).context("RELAY_USER_ID is not a valid user id")?;
        let user = User::new(
            uid,
            get("RELAY_DISPLAY_NAME").unwrap_or_else(|| "Anonymous".into()),
            get("RELAY_EMAIL").unwrap_or_default(),
        );

        let defaults = SuggestionConfig::default();
        let suggestion = SuggestionConfig {
            min_chars: parse_or(
                "RELAY_SUGGEST_MIN_CHARS",
                get("RELAY_SUGGEST_MIN_CHARS"),
                defaults.min_chars,
            ),
            debounce: Duration::from_millis(parse_or(
                "RELAY_SUGGEST_DEBOUNCE_MS",
                get("RELAY_SUGGEST_DEBOUNCE_MS"),
                defaults.debounce.as_millis() as u64,
            )),
        };

        let poll_ms = parse_or("RELAY_POLL_INTERVAL_MS", get("RELAY_POLL_INTERVAL_MS"), 1000u64);

        Ok(Self {
            db_path,
            user,
            suggest_url: get("RELAY_SUGGEST_URL"),
            suggestion,
            poll_interval: Duration::from_millis(poll_ms.max(1)),
        })
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
        None => default,
    }
}
