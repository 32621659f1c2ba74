use std::str::FromStr;
use std::time::Duration;

use vidshelf_store::SmoothingConfig;
use vidshelf_stream::{ConnectionConfig, HeartbeatConfig, ReconnectConfig};

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local development server.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Progress stream endpoint (default: `ws://localhost:3000/ws`).
    pub ws_url: String,
    /// REST base URL (default: `http://localhost:3000/api/v1`).
    pub api_url: String,
    /// Bearer token for both the stream and the REST API.
    pub auth_token: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_idle: Duration,
    pub heartbeat_timeout: Duration,
    /// Always below `reconnect_max`.
    pub history_timeout: Duration,
    /// Smoothing tick period.
    pub tick_interval: Duration,
    /// Maximum display step per tick, in percentage points.
    pub smoothing_step: f32,
    pub completion_grace: Duration,
}

/// A variable was set to something unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                        |
    /// |------------------------------------|--------------------------------|
    /// | `VIDSHELF_WS_URL`                  | `ws://localhost:3000/ws`       |
    /// | `VIDSHELF_API_URL`                 | `http://localhost:3000/api/v1` |
    /// | `VIDSHELF_AUTH_TOKEN`              | empty                          |
    /// | `VIDSHELF_RECONNECT_INITIAL_MS`    | `1000`                         |
    /// | `VIDSHELF_RECONNECT_MAX_MS`        | `30000`                        |
    /// | `VIDSHELF_HEARTBEAT_IDLE_SECS`     | `20`                           |
    /// | `VIDSHELF_HEARTBEAT_TIMEOUT_SECS`  | `10`                           |
    /// | `VIDSHELF_HISTORY_TIMEOUT_SECS`    | `5`                            |
    /// | `VIDSHELF_TICK_MS`                 | `16`                           |
    /// | `VIDSHELF_SMOOTHING_STEP`          | `2`                            |
    /// | `VIDSHELF_COMPLETION_GRACE_SECS`   | `5`                            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let ws_url = text("VIDSHELF_WS_URL", "ws://localhost:3000/ws");
        let api_url = text("VIDSHELF_API_URL", "http://localhost:3000/api/v1");
        let auth_token = text("VIDSHELF_AUTH_TOKEN", "");

        let reconnect_initial = Duration::from_millis(positive(
            &lookup,
            "VIDSHELF_RECONNECT_INITIAL_MS",
            1000,
        )?);
        let reconnect_max = Duration::from_millis(positive(&lookup, "VIDSHELF_RECONNECT_MAX_MS", 30_000)?);
        if reconnect_max < reconnect_initial {
            return Err(ConfigError::Invalid {
                key: "VIDSHELF_RECONNECT_MAX_MS",
                value: reconnect_max.as_millis().to_string(),
                expected: "at least VIDSHELF_RECONNECT_INITIAL_MS",
            });
        }

        let heartbeat_idle = Duration::from_secs(positive(&lookup, "VIDSHELF_HEARTBEAT_IDLE_SECS", 20)?);
        let heartbeat_timeout =
            Duration::from_secs(positive(&lookup, "VIDSHELF_HEARTBEAT_TIMEOUT_SECS", 10)?);

        let mut history_timeout =
            Duration::from_secs(positive(&lookup, "VIDSHELF_HISTORY_TIMEOUT_SECS", 5)?);
        if history_timeout >= reconnect_max {
            let clamped = reconnect_max / 2;
            tracing::warn!(
                configured_ms = history_timeout.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "History timeout must stay below the reconnect ceiling, clamping",
            );
            history_timeout = clamped;
        }

        let tick_interval = Duration::from_millis(positive(&lookup, "VIDSHELF_TICK_MS", 16)?);

        let smoothing_step: f32 = parse(&lookup, "VIDSHELF_SMOOTHING_STEP", 2.0, "a number")?;
        if !smoothing_step.is_finite() || smoothing_step < 0.0 {
            return Err(ConfigError::Invalid {
                key: "VIDSHELF_SMOOTHING_STEP",
                value: smoothing_step.to_string(),
                expected: "a non-negative number",
            });
        }

        let completion_grace = Duration::from_secs(parse(
            &lookup,
            "VIDSHELF_COMPLETION_GRACE_SECS",
            5,
            "a whole number of seconds",
        )?);

        Ok(Self {
            ws_url,
            api_url,
            auth_token,
            reconnect_initial,
            reconnect_max,
            heartbeat_idle,
            heartbeat_timeout,
            history_timeout,
            tick_interval,
            smoothing_step,
            completion_grace,
        })
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectConfig {
                initial_delay: self.reconnect_initial,
                max_delay: self.reconnect_max,
                ..Default::default()
            },
            heartbeat: HeartbeatConfig {
                idle_interval: self.heartbeat_idle,
                pong_timeout: self.heartbeat_timeout,
            },
            history_timeout: self.history_timeout,
            auth_timeout: self.heartbeat_timeout,
        }
    }

    pub fn smoothing_config(&self) -> SmoothingConfig {
        SmoothingConfig {
            step_cap: self.smoothing_step,
            completion_grace: self.completion_grace,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: v,
            expected,
        }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse(lookup, key, default, "a positive integer")?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            expected: "a positive integer",
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.ws_url, "ws://localhost:3000/ws");
        assert_eq!(config.api_url, "http://localhost:3000/api/v1");
        assert!(config.auth_token.is_empty());
        assert_eq!(config.reconnect_initial, Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(30));
        assert_eq!(config.tick_interval, Duration::from_millis(16));
        assert_eq!(config.smoothing_step, 2.0);
        assert_eq!(config.history_timeout, Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("VIDSHELF_WS_URL", "wss://library.example/ws"),
            ("VIDSHELF_RECONNECT_MAX_MS", "60000"),
            ("VIDSHELF_SMOOTHING_STEP", "0.5"),
            ("VIDSHELF_COMPLETION_GRACE_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.ws_url, "wss://library.example/ws");
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert_eq!(config.smoothing_step, 0.5);
        assert_eq!(config.completion_grace, Duration::ZERO);

        let connection = config.connection_config();
        assert_eq!(connection.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.smoothing_config().step_cap, 0.5);
    }

    #[test]
    fn garbage_is_a_config_error() {
        let err = load(&[("VIDSHELF_TICK_MS", "fast")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { key: "VIDSHELF_TICK_MS", .. });

        let err = load(&[("VIDSHELF_HEARTBEAT_IDLE_SECS", "0")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { key: "VIDSHELF_HEARTBEAT_IDLE_SECS", .. });

        let err = load(&[("VIDSHELF_SMOOTHING_STEP", "-1")]).unwrap_err();
        assert_matches!(err, ConfigError::Invalid { key: "VIDSHELF_SMOOTHING_STEP", .. });
    }

    #[test]
    fn backoff_ceiling_below_initial_is_rejected() {
        let err = load(&[
            ("VIDSHELF_RECONNECT_INITIAL_MS", "5000"),
            ("VIDSHELF_RECONNECT_MAX_MS", "1000"),
        ])
        .unwrap_err();
        assert_matches!(err, ConfigError::Invalid { key: "VIDSHELF_RECONNECT_MAX_MS", .. });
    }

    #[test]
    fn history_timeout_is_clamped_below_backoff_ceiling() {
        let config = load(&[
            ("VIDSHELF_RECONNECT_MAX_MS", "4000"),
            ("VIDSHELF_HISTORY_TIMEOUT_SECS", "10"),
        ])
        .unwrap();
        assert_eq!(config.history_timeout, Duration::from_secs(2));
    }
}
