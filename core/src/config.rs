/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SOCKET_URL: &str = "ws://127.0.0.1:5000/socket";
const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Realtime endpoint (ws:// or wss://)
    pub socket_url: String,

    /// REST base URL, without trailing slash
    pub api_base_url: String,

    /// Bearer token sent with every REST call
    pub auth_token: Option<String>,

    /// Retries after the first failed connect before giving up
    pub reconnection_attempts: u32,

    /// Base delay between reconnect attempts
    pub reconnection_delay: Duration,

    /// Upper bound for the exponential reconnect delay
    pub reconnection_delay_max: Duration,

    /// Jitter applied to each reconnect delay (0.0 disables it)
    pub randomization_factor: f64,

    /// Transport-level connect timeout
    pub connect_timeout: Duration,

    /// Upper bound for every REST call made by the core
    pub request_timeout: Duration,

    /// Quiet period after the last keystroke before `typing:stop` goes out
    pub typing_debounce: Duration,

    /// How long a peer's typing indicator stays valid without renewal
    pub typing_expiry: Duration,

    /// Maximum number of emissions buffered while the transport is down
    pub outbound_queue_capacity: usize,

    /// Verbose logging
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            api_base_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            reconnection_attempts: 10,
            reconnection_delay: Duration::from_millis(1000),
            reconnection_delay_max: Duration::from_millis(5000),
            randomization_factor: 0.5,
            connect_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(10),
            typing_debounce: Duration::from_millis(1000),
            typing_expiry: Duration::from_secs(5),
            outbound_queue_capacity: 1024,
            debug: false,
        }
    }
}

impl Config {
    /// Create config from command line arguments.
    ///
    /// Returns the local identity together with the config.
    pub fn from_args(args: &[String]) -> Result<(String, Self)> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user-id> [--socket-url <url>] [--api-url <url>] [--token <token>] [--debug]",
                args.first().map(String::as_str).unwrap_or("helplink")
            )));
        }

        let identity = args[1].trim().to_string();
        if identity.is_empty() || identity.starts_with("--") {
            return Err(SyncError::Config("User id must come first".to_string()));
        }

        let mut config = Config::default();

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--socket-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--socket-url requires a URL argument".to_string())
                    })?;
                    config.socket_url = url.clone();
                    i += 2;
                }
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    config.api_base_url = url.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--token requires a value".to_string())
                    })?;
                    config.auth_token = Some(token.clone());
                    i += 2;
                }
                "--debug" => {
                    config.debug = true;
                    i += 1;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok((identity, config))
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HELPLINK_SOCKET_URL") {
            self.socket_url = url;
        }
        if let Ok(url) = std::env::var("HELPLINK_API_URL") {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(token) = std::env::var("HELPLINK_TOKEN") {
            self.auth_token = Some(token);
        }
        if std::env::var("HELPLINK_DEBUG").is_ok() {
            self.debug = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.socket_url.starts_with("ws://") || self.socket_url.starts_with("wss://")) {
            return Err(SyncError::Config(format!(
                "Socket URL must use ws:// or wss://: {}",
                self.socket_url
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(SyncError::Config(
                "Outbound queue capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnection_delay_max < self.reconnection_delay {
            return Err(SyncError::Config(
                "Max reconnect delay is below the base delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(SyncError::Config(
                "Randomization factor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_parses_flags() {
        let (identity, config) = Config::from_args(&args(&[
            "core",
            "u1",
            "--socket-url",
            "wss://chat.example.org/socket",
            "--api-url",
            "https://chat.example.org/api/",
            "--debug",
        ]))
        .unwrap();

        assert_eq!(identity, "u1");
        assert_eq!(config.socket_url, "wss://chat.example.org/socket");
        assert_eq!(config.api_base_url, "https://chat.example.org/api");
        assert!(config.debug);
    }

    #[test]
    fn test_from_args_requires_identity() {
        assert!(Config::from_args(&args(&["core"])).is_err());
        assert!(Config::from_args(&args(&["core", "--debug"])).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnection_delay_max = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.socket_url = "http://nope".to_string();
        assert!(config.validate().is_err());
    }
}
