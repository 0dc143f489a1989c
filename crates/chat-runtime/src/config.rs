//! Environment-backed runtime tuning for the chat runtime.

use std::{env, fmt, str::FromStr, time::Duration};

use chat_core::ReconnectPolicy;
use thiserror::Error;

const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_JITTER_LOW_MS: u64 = 0;
const DEFAULT_RECONNECT_JITTER_HIGH_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_TOKEN_REFRESH_THRESHOLD_MS: u64 = 10_000;
const DEFAULT_VISIT_WINDOW_MS: u64 = 30 * 60 * 1_000;
const DEFAULT_WELCOME_SETTLE_MS: u64 = 1_500;
const DEFAULT_SNAPSHOT_GRACE_MS: u64 = 5;

/// Runtime configuration shared by every layer of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Backoff shape used after an established connection drops.
    pub reconnect: ReconnectPolicy,
    /// A token expiring within this window is refreshed before the next event.
    pub token_refresh_threshold: Duration,
    /// Inactivity after which the next page view starts a new visit.
    pub visit_window: Duration,
    /// Pause between the welcome send and the user's first message.
    pub welcome_settle_delay: Duration,
    /// Bounded wait in `ThreadHandler::get` for in-flight enrichment.
    pub snapshot_grace: Duration,
    /// Hold events until the customer is authorized.
    pub delay_until_authorized: bool,
    /// Enables the logging session layer.
    pub dev_mode: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::new(
                DEFAULT_RECONNECT_BASE_MS,
                DEFAULT_RECONNECT_JITTER_LOW_MS,
                DEFAULT_RECONNECT_JITTER_HIGH_MS,
                DEFAULT_RECONNECT_MAX_DELAY_MS,
                DEFAULT_RECONNECT_MAX_ATTEMPTS,
            ),
            token_refresh_threshold: Duration::from_millis(DEFAULT_TOKEN_REFRESH_THRESHOLD_MS),
            visit_window: Duration::from_millis(DEFAULT_VISIT_WINDOW_MS),
            welcome_settle_delay: Duration::from_millis(DEFAULT_WELCOME_SETTLE_MS),
            snapshot_grace: Duration::from_millis(DEFAULT_SNAPSHOT_GRACE_MS),
            delay_until_authorized: true,
            dev_mode: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base = parse_or("CHAT_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS, &mut lookup)?;
        let jitter_low = parse_or(
            "CHAT_RECONNECT_JITTER_LOW_MS",
            DEFAULT_RECONNECT_JITTER_LOW_MS,
            &mut lookup,
        )?;
        let jitter_high = parse_or(
            "CHAT_RECONNECT_JITTER_HIGH_MS",
            DEFAULT_RECONNECT_JITTER_HIGH_MS,
            &mut lookup,
        )?;
        let max_delay = parse_or(
            "CHAT_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let max_attempts = parse_or(
            "CHAT_RECONNECT_MAX_ATTEMPTS",
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let token_refresh_threshold_ms = parse_or(
            "CHAT_TOKEN_REFRESH_THRESHOLD_MS",
            DEFAULT_TOKEN_REFRESH_THRESHOLD_MS,
            &mut lookup,
        )?;
        let visit_window_ms = parse_or("CHAT_VISIT_WINDOW_MS", DEFAULT_VISIT_WINDOW_MS, &mut lookup)?;
        let welcome_settle_ms = parse_or(
            "CHAT_WELCOME_SETTLE_MS",
            DEFAULT_WELCOME_SETTLE_MS,
            &mut lookup,
        )?;
        let snapshot_grace_ms = parse_or(
            "CHAT_SNAPSHOT_GRACE_MS",
            DEFAULT_SNAPSHOT_GRACE_MS,
            &mut lookup,
        )?;
        let delay_until_authorized = parse_flag("CHAT_DELAY_UNTIL_AUTHORIZED", true, &mut lookup)?;
        let dev_mode = parse_flag("CHAT_DEV_MODE", false, &mut lookup)?;

        if max_delay < base {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_RECONNECT_MAX_DELAY_MS",
                value: max_delay.to_string(),
                reason: format!("must be at least CHAT_RECONNECT_BASE_MS ({base})"),
            });
        }
        if visit_window_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_VISIT_WINDOW_MS",
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        Ok(Self {
            reconnect: ReconnectPolicy::new(base, jitter_low, jitter_high, max_delay, max_attempts),
            token_refresh_threshold: Duration::from_millis(token_refresh_threshold_ms),
            visit_window: Duration::from_millis(visit_window_ms),
            welcome_settle_delay: Duration::from_millis(welcome_settle_ms),
            snapshot_grace: Duration::from_millis(snapshot_grace_ms),
            delay_until_authorized,
            dev_mode,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
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

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_flag<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}
