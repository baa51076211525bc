//! Bridge configuration.
//!
//! Resolution: built-in defaults, then environment variables.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("Cannot resolve listen address {0}")]
    Resolve(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Relay listen host.
    pub host: String,
    /// Relay listen port.
    pub port: u16,
    /// Directory holding the session store.
    pub auth_dir: PathBuf,
    /// Helper process command line for the external session.
    pub helper_command: String,
    /// Fixed delay before a reconnect attempt.
    pub reconnect_delay_secs: u64,
    /// Per-consumer outbound frame buffer.
    pub consumer_buffer: usize,
    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            auth_dir: default_auth_dir(),
            helper_command: "node whatsapp-helper.js".to_string(),
            reconnect_delay_secs: 5,
            consumer_buffer: 256,
            log_json: false,
        }
    }
}

fn default_auth_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wabridge")
        .join("whatsapp-auth")
}

impl BridgeConfig {
    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by an arbitrary variable source.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("BRIDGE_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "BRIDGE_PORT")? {
            config.port = port;
        }
        if let Some(dir) = lookup("AUTH_DIR").filter(|d| !d.is_empty()) {
            config.auth_dir = expand_home(&dir);
        }
        if let Some(command) = lookup("BRIDGE_HELPER").filter(|c| !c.trim().is_empty()) {
            config.helper_command = command;
        }
        if let Some(delay) = parse_var(&lookup, "BRIDGE_RECONNECT_DELAY_SECS")? {
            config.reconnect_delay_secs = delay;
        }
        if let Some(buffer) = parse_var::<usize, _>(&lookup, "BRIDGE_CONSUMER_BUFFER")? {
            config.consumer_buffer = buffer.max(1);
        }
        if let Some(flag) = lookup("BRIDGE_LOG_JSON") {
            config.log_json = parse_bool("BRIDGE_LOG_JSON", &flag)?;
        }
        Ok(config)
    }

    /// Reconnect delay as a duration.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Resolve `host:port` to a socket address.
    ///
    /// # Errors
    /// Returns error if the host does not resolve.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::Resolve(target))
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(path), |home| home.join(rest)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = tokio_test::assert_ok!(BridgeConfig::from_lookup(lookup(&[])));
        assert_eq!(config.port, 3001);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert!(config.auth_dir.ends_with(".wabridge/whatsapp-auth"));
        assert!(!config.log_json);
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_HOST", "0.0.0.0"),
            ("BRIDGE_PORT", "4000"),
            ("AUTH_DIR", "/var/lib/wabridge"),
            ("BRIDGE_HELPER", "bun helper.ts"),
            ("BRIDGE_RECONNECT_DELAY_SECS", "1"),
            ("BRIDGE_CONSUMER_BUFFER", "0"),
            ("BRIDGE_LOG_JSON", "true"),
        ]))
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert_eq!(config.auth_dir, PathBuf::from("/var/lib/wabridge"));
        assert_eq!(config.helper_command, "bun helper.ts");
        assert_eq!(config.reconnect_delay_secs, 1);
        assert_eq!(config.consumer_buffer, 1);
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_port() {
        let err = tokio_test::assert_err!(BridgeConfig::from_lookup(lookup(&[("BRIDGE_PORT", "http")])));
        assert!(matches!(err, ConfigError::Invalid { key: "BRIDGE_PORT", .. }));
    }

    #[test]
    fn test_invalid_bool() {
        let err = BridgeConfig::from_lookup(lookup(&[("BRIDGE_LOG_JSON", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BRIDGE_LOG_JSON", .. }));
    }

    #[test]
    fn test_listen_addr() {
        let config = BridgeConfig {
            port: 0,
            ..BridgeConfig::default()
        };
        let addr = config.listen_addr().unwrap();
        assert!(addr.ip().is_loopback());
    }
}
