// Client configuration, loaded from TOML.
//
// The file mirrors the layout proxy operators already know:
//
//     [server]
//     host = "relay.example.net"
//     port = 25701
//
//     [client]
//     account = "lobby-1"
//     password = "secret"
//
//     [reconnect]
//     initial_delay_ms = 500
//     max_delay_ms = 30000
//
//     [delivery]
//     buffer_reliable = true
//     reliable_buffer_limit = 4096
//
// Every section except `[client]` may be omitted; missing fields take the
// defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 25701;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: RelayAddress,
    pub client: Credentials,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub delivery: DeliveryPolicy,
}

/// Where the relay listens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayAddress {
    pub host: String,
    pub port: u16,
}

impl Default for RelayAddress {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
        }
    }
}

/// Relay login. `account` doubles as this node's server id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub account: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// What happens to `Delivery::Reliable` payloads sent while the link is down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Queue reliable payloads and send them after the next handshake.
    /// When false they are dropped like unreliable ones.
    pub buffer_reliable: bool,
    /// Queue capacity; once full, newer payloads are dropped.
    pub reliable_buffer_limit: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            buffer_reliable: true,
            reliable_buffer_limit: 4096,
        }
    }
}

impl ClientConfig {
    /// Config with default policies for the given relay and account.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        account: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: RelayAddress {
                host: host.into(),
                port,
            },
            client: Credentials {
                account: account.into(),
                password: password.into(),
            },
            reconnect: ReconnectPolicy::default(),
            delivery: DeliveryPolicy::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.account.is_empty() {
            return Err(ConfigError::Invalid("client.account must not be empty"));
        }
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty"));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file_parses() {
        let config = ClientConfig::from_toml_str(
            r#"
            [server]
            host = "relay.example.net"
            port = 4000

            [client]
            account = "lobby-1"
            password = "secret"

            [reconnect]
            initial_delay_ms = 100
            max_delay_ms = 1000

            [delivery]
            buffer_reliable = false
            reliable_buffer_limit = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.server.host, "relay.example.net");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.client.account, "lobby-1");
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(1));
        assert!(!config.delivery.buffer_reliable);
        assert_eq!(config.delivery.reliable_buffer_limit, 16);
    }

    #[test]
    fn omitted_sections_take_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            [client]
            account = "survival"
            "#,
        )
        .unwrap();
        assert_eq!(config.server, RelayAddress::default());
        assert_eq!(config.client.password, "");
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.delivery, DeliveryPolicy::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = ClientConfig::from_toml_str(
            r#"
            [client]
            account = "survival"
            [reconnect]
            max_delay_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.reconnect.max_delay_ms, 5000);
    }

    #[test]
    fn missing_client_section_is_an_error() {
        let err = ClientConfig::from_toml_str("[server]\nport = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_account_is_rejected() {
        let err = ClientConfig::from_toml_str("[client]\naccount = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ClientConfig::load("/nonexistent/global-connection.toml").unwrap_err();
        match err {
            ConfigError::Io { path, .. } => {
                assert!(path.ends_with("global-connection.toml"))
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
