use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::connection::BackoffPolicy;
use crate::error::RelayError;

const DEFAULT_RELAY_URL: &str = "wss://relay.harbor.dev/ws/mobile";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub relay_url: Url,
    pub auth_token: Option<String>,
    pub client_id: Option<String>,
    pub escalation_delay: Duration,
    pub load_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub offline_mode: bool,
    /// Tracing directives from `HARBOR_LOG_FILTER` or `RUST_LOG`. Replaces the
    /// directives implied by the log level when set.
    pub log_filter: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: Url::parse(DEFAULT_RELAY_URL).expect("default relay url is valid"),
            auth_token: None,
            client_id: None,
            escalation_delay: Duration::from_secs(8),
            load_timeout: Duration::from_secs(12),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            offline_mode: false,
            log_filter: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so callers (and tests) are not
    /// tied to the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let relay_url = match get("HARBOR_RELAY_URL") {
            Some(raw) => parse_relay_url(&raw)?,
            None => defaults.relay_url,
        };

        let backoff = BackoffPolicy {
            base: millis(get("HARBOR_RECONNECT_BASE_MS"), "HARBOR_RECONNECT_BASE_MS")?
                .unwrap_or(defaults.backoff.base),
            cap: millis(get("HARBOR_RECONNECT_CAP_MS"), "HARBOR_RECONNECT_CAP_MS")?
                .unwrap_or(defaults.backoff.cap),
            max_attempts: match get("HARBOR_RECONNECT_MAX_ATTEMPTS") {
                Some(raw) => raw.parse().map_err(|err| ConfigError::InvalidValue {
                    key: "HARBOR_RECONNECT_MAX_ATTEMPTS",
                    reason: format!("{err}"),
                })?,
                None => defaults.backoff.max_attempts,
            },
        };

        Ok(Self {
            relay_url,
            auth_token: get("HARBOR_AUTH_TOKEN"),
            client_id: get("HARBOR_CLIENT_ID"),
            escalation_delay: millis(get("HARBOR_ESCALATION_DELAY_MS"), "HARBOR_ESCALATION_DELAY_MS")?
                .unwrap_or(defaults.escalation_delay),
            load_timeout: millis(get("HARBOR_LOAD_TIMEOUT_MS"), "HARBOR_LOAD_TIMEOUT_MS")?
                .unwrap_or(defaults.load_timeout),
            connect_timeout: millis(get("HARBOR_CONNECT_TIMEOUT_MS"), "HARBOR_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout),
            request_timeout: millis(get("HARBOR_REQUEST_TIMEOUT_MS"), "HARBOR_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout),
            backoff,
            offline_mode: get("HARBOR_OFFLINE_MODE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            log_filter: get("HARBOR_LOG_FILTER").or_else(|| get("RUST_LOG")),
        })
    }
}

pub fn parse_relay_url(raw: &str) -> Result<Url, RelayError> {
    let url = Url::parse(raw.trim())?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(RelayError::InvalidUrl(format!(
            "relay url must use ws or wss, got {other}"
        ))),
    }
}

fn millis(raw: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: u64 = raw.parse().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: format!("{err}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(Some(Duration::from_millis(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_workspace_timings() {
        let cfg = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.escalation_delay, Duration::from_secs(8));
        assert_eq!(cfg.load_timeout, Duration::from_secs(12));
        assert_eq!(cfg.backoff, BackoffPolicy::default());
        assert!(!cfg.offline_mode);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = ClientConfig::from_lookup(lookup(&[
            ("HARBOR_RELAY_URL", "ws://127.0.0.1:9000/ws"),
            ("HARBOR_ESCALATION_DELAY_MS", "2500"),
            ("HARBOR_RECONNECT_MAX_ATTEMPTS", "3"),
            ("HARBOR_OFFLINE_MODE", "yes"),
            ("HARBOR_AUTH_TOKEN", "  "),
        ]))
        .unwrap();
        assert_eq!(cfg.relay_url.as_str(), "ws://127.0.0.1:9000/ws");
        assert_eq!(cfg.escalation_delay, Duration::from_millis(2500));
        assert_eq!(cfg.backoff.max_attempts, 3);
        assert!(cfg.offline_mode);
        assert_eq!(cfg.auth_token, None);
    }

    #[test]
    fn log_filter_prefers_harbor_variable() {
        assert_eq!(ClientConfig::from_lookup(lookup(&[])).unwrap().log_filter, None);

        let cfg = ClientConfig::from_lookup(lookup(&[("RUST_LOG", "debug")])).unwrap();
        assert_eq!(cfg.log_filter.as_deref(), Some("debug"));

        let cfg = ClientConfig::from_lookup(lookup(&[
            ("RUST_LOG", "debug"),
            ("HARBOR_LOG_FILTER", "harbor::connection=trace"),
        ]))
        .unwrap();
        assert_eq!(cfg.log_filter.as_deref(), Some("harbor::connection=trace"));
    }

    #[test]
    fn rejects_non_websocket_relay() {
        let err = ClientConfig::from_lookup(lookup(&[("HARBOR_RELAY_URL", "https://relay.example")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Relay(RelayError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_zero_durations() {
        let err = ClientConfig::from_lookup(lookup(&[("HARBOR_LOAD_TIMEOUT_MS", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "HARBOR_LOAD_TIMEOUT_MS",
                reason: "must be greater than zero".into(),
            }
        );
    }
}
