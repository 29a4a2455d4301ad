use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unset means sessions live in process memory (development only).
    pub database_url: Option<String>,
    pub anthropic_api_key: String,
    pub voice_api_url: String,
    pub voice_api_key: String,
    pub public_base_url: String,
    pub checkpoint_interval: Duration,
    pub feedback_timeout: Duration,
    pub max_interview_duration: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: std::env::var("DATABASE_URL").ok(),
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            voice_api_url: std::env::var("VOICE_API_URL")
                .unwrap_or_else(|_| "https://api.vapi.ai".to_string()),
            voice_api_key: require_env("VOICE_API_KEY")?,
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            checkpoint_interval: Duration::from_secs(parse_env("CHECKPOINT_INTERVAL_SECS", 30)?),
            feedback_timeout: Duration::from_secs(parse_env("FEEDBACK_TIMEOUT_SECS", 60)?),
            max_interview_duration: Duration::from_secs(
                parse_env("MAX_INTERVIEW_MINUTES", 30)? * 60,
            ),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse::<u64>()
                .with_context(|| format!("{key} must be a positive integer, got '{raw}'"))?;
            anyhow::ensure!(value > 0, "{key} must be greater than zero");
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}
