use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::QuireError;

/// Tunables for one pipeline run. Defaults match production settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Additional attempts after the first one fails.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub title_similarity_threshold: f64,
    pub semantic_similarity_threshold: f64,
    pub historical_window_days: i64,
    pub candidate_lookback_days: i64,
    pub body_batch_size: usize,
    pub body_batch_count: usize,
    pub headline_max_chars: usize,
    pub min_fact_check_ratio: f64,
    pub scoring_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            title_similarity_threshold: 0.80,
            semantic_similarity_threshold: 0.88,
            historical_window_days: 30,
            candidate_lookback_days: 7,
            body_batch_size: 3,
            body_batch_count: 2,
            headline_max_chars: 120,
            min_fact_check_ratio: 0.5,
            scoring_concurrency: 4,
        }
    }
}

impl PipelineSettings {
    /// Defaults overlaid with any values present in the environment.
    pub fn from_env() -> Result<Self, QuireError> {
        let defaults = Self::default();
        let settings = Self {
            max_retries: optional_env("MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_delay: optional_env::<u64>("RETRY_DELAY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
            title_similarity_threshold: optional_env("TITLE_SIMILARITY_THRESHOLD")?
                .unwrap_or(defaults.title_similarity_threshold),
            semantic_similarity_threshold: optional_env("SEMANTIC_SIMILARITY_THRESHOLD")?
                .unwrap_or(defaults.semantic_similarity_threshold),
            historical_window_days: optional_env("HISTORICAL_WINDOW_DAYS")?
                .unwrap_or(defaults.historical_window_days),
            candidate_lookback_days: optional_env("CANDIDATE_LOOKBACK_DAYS")?
                .unwrap_or(defaults.candidate_lookback_days),
            body_batch_size: optional_env("BODY_BATCH_SIZE")?.unwrap_or(defaults.body_batch_size),
            body_batch_count: optional_env("BODY_BATCH_COUNT")?
                .unwrap_or(defaults.body_batch_count),
            headline_max_chars: optional_env("HEADLINE_MAX_CHARS")?
                .unwrap_or(defaults.headline_max_chars),
            min_fact_check_ratio: optional_env("MIN_FACT_CHECK_RATIO")?
                .unwrap_or(defaults.min_fact_check_ratio),
            scoring_concurrency: optional_env("SCORING_CONCURRENCY")?
                .unwrap_or(defaults.scoring_concurrency),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), QuireError> {
        for (name, value) in [
            ("TITLE_SIMILARITY_THRESHOLD", self.title_similarity_threshold),
            ("SEMANTIC_SIMILARITY_THRESHOLD", self.semantic_similarity_threshold),
            ("MIN_FACT_CHECK_RATIO", self.min_fact_check_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(QuireError::Config(format!("{name} must be within 0.0-1.0, got {value}")));
            }
        }
        if self.body_batch_size == 0 || self.body_batch_count == 0 {
            return Err(QuireError::Config("body batches must be non-empty".into()));
        }
        if self.scoring_concurrency == 0 {
            return Err(QuireError::Config("SCORING_CONCURRENCY must be at least 1".into()));
        }
        if self.historical_window_days < 0 || self.candidate_lookback_days < 0 {
            return Err(QuireError::Config("day windows cannot be negative".into()));
        }
        Ok(())
    }

    /// Candidates considered for generation per article module.
    pub fn generation_pool_size(&self) -> usize {
        self.body_batch_size * self.body_batch_count
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    // AI providers
    pub anthropic_api_key: String,
    pub voyage_api_key: String,
    pub generation_model: String,

    // Ingestion
    pub feed_urls: Vec<String>,

    // Notifications
    pub slack_webhook_url: Option<String>,

    pub pipeline: PipelineSettings,
}

impl Config {
    /// Load configuration for a full pipeline run.
    pub fn from_env() -> Result<Self, QuireError> {
        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            anthropic_api_key: required_env("ANTHROPIC_API_KEY")?,
            voyage_api_key: required_env("VOYAGE_API_KEY")?,
            generation_model: env::var("GENERATION_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            feed_urls: env::var("FEED_URLS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
            slack_webhook_url: env::var("SLACK_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
            pipeline: PipelineSettings::from_env()?,
        })
    }

    /// Load the minimal config for store-only commands (migrate, reset, assign).
    pub fn store_from_env() -> Result<Self, QuireError> {
        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            anthropic_api_key: String::new(),
            voyage_api_key: String::new(),
            generation_model: String::new(),
            feed_urls: Vec::new(),
            slack_webhook_url: None,
            pipeline: PipelineSettings::from_env()?,
        })
    }

    /// Log the effective configuration with secrets reduced to presence flags.
    pub fn log_redacted(&self) {
        info!(
            database = %redact_url(&self.database_url),
            anthropic_key = !self.anthropic_api_key.is_empty(),
            voyage_key = !self.voyage_api_key.is_empty(),
            model = self.generation_model.as_str(),
            feeds = self.feed_urls.len(),
            slack = self.slack_webhook_url.is_some(),
            max_retries = self.pipeline.max_retries,
            retry_delay_secs = self.pipeline.retry_delay.as_secs(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> Result<String, QuireError> {
    env::var(key).map_err(|_| QuireError::Config(format!("{key} environment variable is required")))
}

fn optional_env<T: FromStr>(key: &str) -> Result<Option<T>, QuireError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QuireError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(None),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop credentials from a connection URL before logging it.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.generation_pool_size(), 6);
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let settings = PipelineSettings {
            title_similarity_threshold: 1.2,
            ..PipelineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(QuireError::Config(_))));
    }

    #[test]
    fn empty_batches_are_rejected() {
        let settings = PipelineSettings {
            body_batch_size: 0,
            ..PipelineSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parse_list_skips_blank_entries() {
        assert_eq!(
            parse_list(" https://a.example/feed , ,https://b.example/rss"),
            vec!["https://a.example/feed", "https://b.example/rss"]
        );
    }

    #[test]
    fn redact_url_hides_password() {
        let redacted = redact_url("postgres://quire:hunter2@db:5432/quire");
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.contains("***"));
    }
}
