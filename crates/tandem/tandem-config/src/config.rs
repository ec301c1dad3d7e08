use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use tandem_core::{AccessDescriptor, Timeout};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TandemConfig {
    /// Names the server -> client channel.
    #[serde(default = "defaults::client_id")]
    pub client_id: String,
    /// Names the client -> server channel.
    #[serde(default = "defaults::server_id")]
    pub server_id: String,
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "defaults::recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "defaults::liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Unix permission bits for every object the server creates.
    #[serde(default = "defaults::access_mode")]
    pub access_mode: u32,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Ping/pong exchanges the demo binaries perform.
    #[serde(default = "defaults::rounds")]
    pub rounds: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

mod defaults {
    pub fn client_id() -> String {
        "client".into()
    }

    pub fn server_id() -> String {
        "server".into()
    }

    pub fn capacity() -> usize {
        4096
    }

    pub fn send_timeout_ms() -> u64 {
        1000
    }

    pub fn recv_timeout_ms() -> u64 {
        1000
    }

    pub fn liveness_interval_ms() -> u64 {
        50
    }

    pub fn access_mode() -> u32 {
        0o600
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn rounds() -> u32 {
        10
    }
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self {
            client_id: defaults::client_id(),
            server_id: defaults::server_id(),
            capacity: defaults::capacity(),
            send_timeout_ms: defaults::send_timeout_ms(),
            recv_timeout_ms: defaults::recv_timeout_ms(),
            liveness_interval_ms: defaults::liveness_interval_ms(),
            access_mode: defaults::access_mode(),
            log_level: defaults::log_level(),
            rounds: defaults::rounds(),
        }
    }
}

impl TandemConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&toml_to_str)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TandemConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid("capacity must be non-zero"));
        }
        if self.client_id.is_empty() || self.server_id.is_empty() {
            return Err(ConfigError::Invalid("channel ids must not be empty"));
        }
        if self.client_id == self.server_id {
            return Err(ConfigError::Invalid("client_id and server_id must differ"));
        }
        if self.liveness_interval_ms == 0 {
            return Err(ConfigError::Invalid("liveness_interval_ms must be non-zero"));
        }
        if self.access_mode > 0o777 {
            return Err(ConfigError::Invalid("access_mode has bits outside 0o777"));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Timeout {
        Timeout::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Timeout {
        Timeout::from_millis(self.recv_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn access(&self) -> AccessDescriptor {
        AccessDescriptor::new(self.access_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TandemConfig::from_toml_str("").expect("parse");
        assert_eq!(config, TandemConfig::default());
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.access().mode(), 0o600);
        assert_eq!(config.liveness_interval(), Duration::from_millis(50));
    }

    #[test]
    fn fields_override_defaults() {
        let config = TandemConfig::from_toml_str(
            r#"
            client_id = "ticks"
            server_id = "orders"
            capacity = 256
            recv_timeout_ms = 250
            access_mode = 0o660
            rounds = 3
            "#,
        )
        .expect("parse");

        assert_eq!(config.client_id, "ticks");
        assert_eq!(config.server_id, "orders");
        assert_eq!(config.capacity, 256);
        assert_eq!(config.recv_timeout(), Timeout::Bounded(Duration::from_millis(250)));
        assert_eq!(config.send_timeout(), Timeout::Bounded(Duration::from_millis(1000)));
        assert_eq!(config.access().mode(), 0o660);
        assert_eq!(config.rounds, 3);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for doc in [
            "capacity = 0",
            "client_id = \"\"",
            "client_id = \"same\"\nserver_id = \"same\"",
            "liveness_interval_ms = 0",
            "access_mode = 0o1777",
        ] {
            assert!(
                matches!(TandemConfig::from_toml_str(doc), Err(ConfigError::Invalid(_))),
                "accepted {doc:?}"
            );
        }
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            TandemConfig::from_toml_str("capacity = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = TandemConfig::load("/nonexistent/tandem.toml").unwrap_err();
        match err {
            ConfigError::Read { path, .. } => assert_eq!(path, "/nonexistent/tandem.toml"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
