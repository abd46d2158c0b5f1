//! Configuration and paths

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the stored auth token
pub const TOKEN_ENV_VAR: &str = "CHAT_SENTINEL_TOKEN";

/// Local development backend
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Analysis status poll interval (5 seconds)
pub const DEFAULT_ANALYSIS_POLL_MS: u64 = 5000;

/// All configurable endpoints, paths and timings
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub config_dir: PathBuf,
    pub token_file: PathBuf,
    pub request_timeout_secs: u64,
    pub analysis_poll_interval_ms: u64,
    /// `None` polls until a verdict or cancellation
    pub analysis_max_polls: Option<u32>,
    /// 0 disables reconnect
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-sentinel");

        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: ws_base_for(DEFAULT_API_URL)
                .unwrap_or_else(|_| "ws://127.0.0.1:8000".to_string()),
            token_file: config_dir.join("auth_token"),
            config_dir,
            request_timeout_secs: 30,
            analysis_poll_interval_ms: DEFAULT_ANALYSIS_POLL_MS,
            analysis_max_polls: None,
            reconnect_attempts: 0,
            reconnect_base_delay_ms: 500,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            api_base_url: "http://127.0.0.1:9".to_string(),
            ws_base_url: "ws://127.0.0.1:9".to_string(),
            config_dir: temp_dir.to_path_buf(),
            token_file: temp_dir.join("auth_token"),
            request_timeout_secs: 5,
            analysis_poll_interval_ms: DEFAULT_ANALYSIS_POLL_MS,
            analysis_max_polls: None,
            reconnect_attempts: 0,
            reconnect_base_delay_ms: 500,
        }
    }

    /// Defaults overridden by `CHAT_SENTINEL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("CHAT_SENTINEL_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
            config.token_file = config.config_dir.join("auth_token");
        }

        if let Some(api) = lookup("CHAT_SENTINEL_API_URL") {
            config.api_base_url = api.trim_end_matches('/').to_string();
            config.ws_base_url = ws_base_for(&config.api_base_url)?;
        }

        if let Some(ws) = lookup("CHAT_SENTINEL_WS_URL") {
            config.ws_base_url = ws.trim_end_matches('/').to_string();
        }

        if let Some(ms) = lookup("CHAT_SENTINEL_POLL_MS") {
            config.analysis_poll_interval_ms = parse_var("CHAT_SENTINEL_POLL_MS", &ms)?;
            if config.analysis_poll_interval_ms == 0 {
                return Err(Error::Config(
                    "CHAT_SENTINEL_POLL_MS must be greater than 0".to_string(),
                ));
            }
        }

        if let Some(max) = lookup("CHAT_SENTINEL_MAX_POLLS") {
            config.analysis_max_polls = Some(parse_var("CHAT_SENTINEL_MAX_POLLS", &max)?);
        }

        if let Some(n) = lookup("CHAT_SENTINEL_RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_var("CHAT_SENTINEL_RECONNECT_ATTEMPTS", &n)?;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn analysis_poll_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_poll_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

/// Derive the websocket base from an HTTP API base
pub fn ws_base_for(api_base_url: &str) -> Result<String> {
    let base = api_base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = base.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else {
        Err(Error::Config(format!(
            "API URL must start with http:// or https://: {}",
            api_base_url
        )))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://127.0.0.1:8000");
        assert_eq!(config.ws_base_url, "ws://127.0.0.1:8000");
        assert!(config.token_file.ends_with("auth_token"));
        assert_eq!(config.analysis_poll_interval(), Duration::from_secs(5));
        assert_eq!(config.analysis_max_polls, None);
        assert_eq!(config.reconnect_attempts, 0);
    }

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        assert_eq!(config.config_dir, temp);
        assert_eq!(config.token_file, temp.join("auth_token"));
    }

    #[test]
    fn test_ws_base_derivation() {
        assert_eq!(ws_base_for("http://localhost:8000").unwrap(), "ws://localhost:8000");
        assert_eq!(ws_base_for("https://chat.example.com/").unwrap(), "wss://chat.example.com");
        assert!(matches!(ws_base_for("ftp://nope"), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHAT_SENTINEL_API_URL", "https://chat.example.com/"),
            ("CHAT_SENTINEL_CONFIG_DIR", "/tmp/sentinel"),
            ("CHAT_SENTINEL_POLL_MS", "250"),
            ("CHAT_SENTINEL_MAX_POLLS", "12"),
            ("CHAT_SENTINEL_RECONNECT_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://chat.example.com");
        assert_eq!(config.ws_base_url, "wss://chat.example.com");
        assert_eq!(config.token_file, PathBuf::from("/tmp/sentinel/auth_token"));
        assert_eq!(config.analysis_poll_interval_ms, 250);
        assert_eq!(config.analysis_max_polls, Some(12));
        assert_eq!(config.reconnect_attempts, 3);
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHAT_SENTINEL_API_URL", "http://api.local"),
            ("CHAT_SENTINEL_WS_URL", "ws://realtime.local/"),
        ]))
        .unwrap();
        assert_eq!(config.ws_base_url, "ws://realtime.local");
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = Config::from_lookup(lookup_from(&[("CHAT_SENTINEL_POLL_MS", "0")]));
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("greater than 0")));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let result = Config::from_lookup(lookup_from(&[("CHAT_SENTINEL_POLL_MS", "soon")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
