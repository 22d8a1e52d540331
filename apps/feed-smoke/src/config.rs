//! Environment-backed configuration for `feed-smoke`.

use std::env;

use feed_core::FeedTuning;
use thiserror::Error;

const DEFAULT_USER_ID: &str = "buyer-1";

/// Smoke driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Signed-in user the driver acts as.
    pub user_id: String,
    /// Runtime overrides; absent keys keep runtime defaults.
    pub tuning: FeedTuning,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("FEED_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());

        let tuning = FeedTuning {
            conversation_limit: parse_optional("FEED_CONVERSATION_LIMIT", &mut lookup)?,
            page_size: parse_nonzero("FEED_PAGE_SIZE", &mut lookup)?,
            timeline_max_items: parse_nonzero("FEED_TIMELINE_MAX_ITEMS", &mut lookup)?,
            fallback_delay_ms: parse_optional("FEED_FALLBACK_DELAY_MS", &mut lookup)?,
            disconnected_fallback_delay_ms: parse_optional(
                "FEED_DISCONNECTED_FALLBACK_DELAY_MS",
                &mut lookup,
            )?,
            persist_timeout_ms: parse_optional("FEED_PERSIST_TIMEOUT_MS", &mut lookup)?,
            subscribe_max_attempts: parse_nonzero("FEED_SUBSCRIBE_MAX_ATTEMPTS", &mut lookup)?,
        };

        Ok(Self { user_id, tuning })
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_nonzero<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    match parse_optional::<T, F>(key, lookup)? {
        Some(value) if value == T::default() => Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        }),
        other => Ok(other),
    }
}
