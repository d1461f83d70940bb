//! Configuration for the multiplexer and the protocol client.
//!
//! Both structs deserialize from JSON with every field optional, so a config
//! file only has to name what it changes. Durations are plain milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::http::ProxyConfig;
use crate::validator::MAX_TRIES;

/// Settings of a `Multiplexer`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Cap on simultaneously running transfers. `None` means unbounded.
    pub max_concurrency: Option<usize>,
    /// Attempt ceiling per request, whatever the validator says.
    pub max_tries: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            max_tries: MAX_TRIES,
        }
    }
}

/// Transport settings applied to every request a `Client` submits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint URL requests are posted to.
    pub location: String,
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub proxy: Option<ProxyConfig>,
    /// Basic auth login; sent only together with `password`.
    pub login: Option<String>,
    pub password: Option<String>,
    /// Extra headers, sent in order after the codec's own.
    pub headers: Vec<(String, String)>,
    pub verify_tls: bool,
    pub host_override: Option<String>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            location: String::new(),
            timeout_ms: None,
            connect_timeout_ms: None,
            proxy: None,
            login: None,
            password: None,
            headers: Vec::new(),
            verify_tls: true,
            host_override: None,
            user_agent: concat!("callmux/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn basic_auth(&self) -> Option<(String, String)> {
        Some((self.login.clone()?, self.password.clone()?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_basic_auth(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_host_override(mut self, host: impl Into<String>) -> Self {
        self.host_override = Some(host.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplexer_defaults() {
        let config = MultiplexerConfig::default();
        assert_eq!(config.max_concurrency, None);
        assert_eq!(config.max_tries, MAX_TRIES);
    }

    #[test]
    fn client_config_from_partial_json() {
        let config = ClientConfig::from_json(
            r#"{
                "location": "https://api.example.com/rpc",
                "timeout_ms": 2500,
                "proxy": {"host": "proxy.local", "port": 3128},
                "headers": [["X-Tenant", "acme"]],
                "verify_tls": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.location, "https://api.example.com/rpc");
        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.proxy, Some(ProxyConfig::new("proxy.local", 3128)));
        assert_eq!(config.headers, vec![("X-Tenant".to_string(), "acme".to_string())]);
        assert!(!config.verify_tls);
        assert!(config.user_agent.starts_with("callmux/"));
    }

    #[test]
    fn basic_auth_needs_both_parts() {
        let config = ClientConfig {
            login: Some("user".to_string()),
            ..ClientConfig::default()
        };
        assert_eq!(config.basic_auth(), None);
        let config = config.with_basic_auth("user", "secret");
        assert_eq!(config.basic_auth(), Some(("user".to_string(), "secret".to_string())));
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(ClientConfig::from_json("{\"timeout_ms\": \"soon\"}").is_err());
    }
}
