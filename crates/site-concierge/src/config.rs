use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Longest accepted quota window: one year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Service configuration loaded explicitly from environment variables.
///
/// The dataset paths have no defaults; everything else falls back to production values.
/// LLM transport settings are read separately by `OpenAiClientConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// JSON array of FAQ entries.
    pub faq_path: PathBuf,
    /// JSON array of navigation entries.
    pub navigation_path: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub matching: MatchingConfig,
    /// Model id used for both the fallback classifier and reply generation.
    pub llm_model: String,
    /// Take the client address from the first `X-Forwarded-For` hop.
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub state_path: PathBuf,
    pub max_requests: u32,
    pub window: Duration,
    /// Persist on every Nth increment inside a window.
    pub persist_every: u32,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/rate_limits.json"),
            max_requests: 30,
            window: Duration::from_secs(12 * 60 * 60),
            persist_every: 5,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub faq_min_score: u32,
    pub navigation_min_score: u32,
    /// Keywords per navigation item shown to the fallback classifier.
    pub classifier_keyword_preview: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            faq_min_score: 50,
            navigation_min_score: 30,
            classifier_keyword_preview: 5,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FAQ_DATA_PATH`
    /// - `NAVIGATION_DATA_PATH`
    ///
    /// Optional (defaults in parentheses):
    /// - `CONCIERGE_LISTEN_ADDR` ("0.0.0.0:3000")
    /// - `RATE_LIMIT_STATE_PATH` ("data/rate_limits.json"), `RATE_LIMIT_MAX_REQUESTS` (30),
    ///   `RATE_LIMIT_WINDOW_SECS` (43200), `RATE_LIMIT_PERSIST_EVERY` (5),
    ///   `RATE_LIMIT_SWEEP_SECS` (3600)
    /// - `FAQ_MIN_SCORE` (50), `NAVIGATION_MIN_SCORE` (30), `CLASSIFIER_KEYWORD_PREVIEW` (5)
    /// - `LLM_MODEL` ("gpt-4o-mini"), `TRUST_FORWARDED_FOR` (false)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::Config(format!("{key} environment variable is required")))
        };

        let rate_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            state_path: lookup("RATE_LIMIT_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(rate_defaults.state_path),
            max_requests: positive(&lookup, "RATE_LIMIT_MAX_REQUESTS", rate_defaults.max_requests)?,
            window: Duration::from_secs(window_secs(&lookup, rate_defaults.window.as_secs())?),
            persist_every: positive(&lookup, "RATE_LIMIT_PERSIST_EVERY", rate_defaults.persist_every)?,
            sweep_interval: Duration::from_secs(positive(
                &lookup,
                "RATE_LIMIT_SWEEP_SECS",
                rate_defaults.sweep_interval.as_secs(),
            )?),
        };

        let match_defaults = MatchingConfig::default();
        let matching = MatchingConfig {
            faq_min_score: parsed(&lookup, "FAQ_MIN_SCORE", match_defaults.faq_min_score)?,
            navigation_min_score: parsed(
                &lookup,
                "NAVIGATION_MIN_SCORE",
                match_defaults.navigation_min_score,
            )?,
            classifier_keyword_preview: parsed(
                &lookup,
                "CLASSIFIER_KEYWORD_PREVIEW",
                match_defaults.classifier_keyword_preview,
            )?,
        };

        let trust_forwarded_for = lookup("TRUST_FORWARDED_FOR")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            listen_addr: lookup("CONCIERGE_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            faq_path: PathBuf::from(required("FAQ_DATA_PATH")?),
            navigation_path: PathBuf::from(required("NAVIGATION_DATA_PATH")?),
            rate_limit,
            matching,
            llm_model: lookup("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            trust_forwarded_for,
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} must be a non-negative integer, got {raw:?}"))),
    }
}

fn positive<T: FromStr + PartialEq + Default>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    let value = parsed(lookup, key, default)?;
    if value == T::default() {
        return Err(AppError::Config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

fn window_secs(lookup: &impl Fn(&str) -> Option<String>, default: u64) -> Result<u64, AppError> {
    let secs = positive(lookup, "RATE_LIMIT_WINDOW_SECS", default)?;
    if secs > MAX_WINDOW_SECS {
        return Err(AppError::Config(format!(
            "RATE_LIMIT_WINDOW_SECS must be at most {MAX_WINDOW_SECS}, got {secs}"
        )));
    }
    Ok(secs)
}
