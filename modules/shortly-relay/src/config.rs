use std::time::Duration;

use anyhow::{Context, Result};
use shortly_replication::Service;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub service: Service,

    // Database
    pub database_url: String,

    // Queue transport
    pub queue_api_url: String,
    pub queue_api_token: Option<String>,
    pub pull_batch_size: usize,
    pub pull_visibility: Duration,
    pub retry_delay: Duration,

    // Dispatch
    pub dispatch_interval: Duration,
    pub dispatch_batch_limit: usize,

    /// Topic for live lookup updates. Unset disables the fan-out.
    pub live_analytics_topic: Option<String>,

    pub log_json: bool,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            service: std::env::var("SERVICE")
                .context("SERVICE environment variable is required")?
                .parse()?,
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable is required")?,
            queue_api_url: std::env::var("QUEUE_API_URL")
                .context("QUEUE_API_URL environment variable is required")?,
            queue_api_token: std::env::var("QUEUE_API_TOKEN").ok(),
            pull_batch_size: parse_or("PULL_BATCH_SIZE", 10)?,
            pull_visibility: Duration::from_millis(parse_or("PULL_VISIBILITY_MS", 30_000)?),
            retry_delay: Duration::from_secs(parse_or("RETRY_DELAY_SECS", 10)?),
            dispatch_interval: Duration::from_millis(parse_or("DISPATCH_INTERVAL_MS", 5_000)?),
            dispatch_batch_limit: parse_or("DISPATCH_BATCH_LIMIT", 100)?,
            live_analytics_topic: std::env::var("LIVE_ANALYTICS_TOPIC")
                .ok()
                .filter(|s| !s.is_empty()),
            log_json: log_json_from_env(),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(5).collect();
            format!("{}...({} chars)", head, val.chars().count())
        }
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => preview(v),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  SERVICE: {}", self.service);
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!("  QUEUE_API_URL: {}", self.queue_api_url);
        tracing::info!("  QUEUE_API_TOKEN: {}", preview_opt(&self.queue_api_token));
        tracing::info!(
            "  LIVE_ANALYTICS_TOPIC: {}",
            self.live_analytics_topic.as_deref().unwrap_or("<not set>")
        );
    }
}

/// Read before tracing is initialised, so the subscriber can pick a format.
pub fn log_json_from_env() -> bool {
    std::env::var("LOG_FORMAT")
        .map(|v| !v.eq_ignore_ascii_case("pretty"))
        .unwrap_or(true)
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got '{raw}'")),
        _ => Ok(default),
    }
}
