//! Channel configuration.
//!
//! Built in code with the `with_*` builders or loaded from environment
//! variables. Numeric env values that fail to parse fall back to defaults so
//! a typo degrades to stock behavior instead of refusing to start; only a
//! missing or malformed URL is fatal.

use std::time::Duration;

use tokio_tungstenite::tungstenite::http::Uri;

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

pub const ENV_URL: &str = "LIVEWIRE_URL";
pub const ENV_PROTOCOLS: &str = "LIVEWIRE_PROTOCOLS";
pub const ENV_RECONNECT_ATTEMPTS: &str = "LIVEWIRE_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_INTERVAL_MS: &str = "LIVEWIRE_RECONNECT_INTERVAL_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "LIVEWIRE_HEARTBEAT_INTERVAL_MS";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing endpoint url (set {var})")]
    MissingUrl { var: &'static str },
    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
}

/// Everything needed to open and keep alive one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Endpoint to connect to (`ws://` or `wss://`).
    pub url: String,
    /// Sub-protocols offered during the handshake, in preference order.
    pub protocols: Vec<String>,
    /// Maximum automatic retries before settling in `error`.
    pub reconnect_attempts: u32,
    /// Fixed delay between retries.
    pub reconnect_interval: Duration,
    /// Delay between keep-alive sends while connected.
    pub heartbeat_interval: Duration,
}

impl ChannelConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }

    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Build a validated config from environment variables.
    ///
    /// Required:
    /// - `LIVEWIRE_URL`
    ///
    /// Optional:
    /// - `LIVEWIRE_PROTOCOLS`: comma separated sub-protocol list
    /// - `LIVEWIRE_RECONNECT_ATTEMPTS`: default 5
    /// - `LIVEWIRE_RECONNECT_INTERVAL_MS`: default 3000
    /// - `LIVEWIRE_HEARTBEAT_INTERVAL_MS`: default 30000
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the URL is missing or invalid, or an
    /// interval is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ChannelConfig::from_env`] with an explicit variable source.
    ///
    /// # Errors
    ///
    /// See [`ChannelConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_URL)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingUrl { var: ENV_URL })?;

        let protocols = lookup(ENV_PROTOCOLS)
            .map(|raw| parse_protocols(&raw))
            .unwrap_or_default();

        let config = Self::new(url)
            .with_protocols(protocols)
            .with_reconnect_attempts(env_parse(&lookup, ENV_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_ATTEMPTS))
            .with_reconnect_interval(Duration::from_millis(env_parse(
                &lookup,
                ENV_RECONNECT_INTERVAL_MS,
                DEFAULT_RECONNECT_INTERVAL_MS,
            )))
            .with_heartbeat_interval(Duration::from_millis(env_parse(
                &lookup,
                ENV_HEARTBEAT_INTERVAL_MS,
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )));
        config.validate()?;
        Ok(config)
    }

    /// Check the URL scheme and that both intervals are non-zero.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl { var: ENV_URL });
        }
        let uri = self.url.parse::<Uri>().map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match uri.scheme_str() {
            Some("ws" | "wss") => {}
            other => {
                return Err(ConfigError::InvalidUrl {
                    url: self.url.clone(),
                    reason: format!("unsupported scheme {}", other.unwrap_or("(none)")),
                });
            }
        }
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "reconnect_interval" });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval { field: "heartbeat_interval" });
        }
        Ok(())
    }
}

fn parse_protocols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
