//! Configuration module for tether.
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // Telegram
    pub bot_token: String,

    /// Bot username (without @). Fetched via getMe if not set.
    pub bot_username: Option<String>,

    /// Owner user IDs (comma-separated). They pass every rights check.
    pub owner_ids: Vec<u64>,

    // MongoDB
    pub mongodb_uri: String,
    pub mongodb_database: String,

    /// How long a `/move` request waits for an answer.
    pub move_request_ttl: Duration,

    /// Buffer of each change-feed channel before slow readers lag.
    pub change_feed_capacity: usize,

    pub default_lang: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Panics
    /// Panics if required environment variables are not set.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let owner_ids = env::var("OWNER_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<u64>().ok())
            .collect();

        let bot_username = env::var("BOT_USERNAME")
            .ok()
            .map(|s| s.trim_start_matches('@').to_string())
            .filter(|s| !s.is_empty());

        let default_lang = match env::var("DEFAULT_LANG").map(|l| l.to_lowercase()) {
            Ok(lang) if crate::i18n::is_supported(&lang) => lang,
            _ => "en".to_string(),
        };

        Self {
            bot_token: env::var("BOT_TOKEN").expect("BOT_TOKEN must be set"),
            bot_username,
            owner_ids,
            mongodb_uri: env::var("MONGODB_URI").expect("MONGODB_URI must be set"),
            mongodb_database: env::var("MONGODB_DATABASE")
                .unwrap_or_else(|_| "tether".to_string()),
            move_request_ttl: Duration::from_secs(60 * parse_or("MOVE_REQUEST_TTL_MINS", 15u64)),
            change_feed_capacity: parse_or("CHANGE_FEED_CAPACITY", 256usize).max(1),
            default_lang,
        }
    }
}

/// Parse `key`, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
