//! Relay configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `COEDIT_*` environment variables. Command-line flags are applied on top by
//! the binary.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "COEDIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("unsupported transport {0:?} (only \"tcp\" is available)")]
    UnsupportedTransport(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("outbound_buffer must hold at least {min} lines, got {0}", min = MIN_OUTBOUND_BUFFER)]
    OutboundBufferTooSmall(usize),
}

/// Room for a couple of whole edits; a queue that cannot take one closes
/// its connection.
pub const MIN_OUTBOUND_BUFFER: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_address: String,
    pub port: u16,
    pub transport: String,
    /// How long a joiner waits for the host's snapshot.
    pub sync_timeout_secs: u64,
    pub max_line_length: usize,
    pub max_snapshot_rows: usize,
    /// Lines queued per connection. A peer whose queue fills up because it
    /// stopped reading is disconnected.
    pub outbound_buffer: usize,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3018,
            transport: "tcp".to_string(),
            sync_timeout_secs: 10,
            max_line_length: 64 * 1024,
            max_snapshot_rows: 1_000_000,
            outbound_buffer: 256,
            log_format: LogFormat::Pretty,
        }
    }
}

impl RelayConfig {
    /// Load defaults, `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.transport.eq_ignore_ascii_case("tcp") {
            return Err(ConfigError::UnsupportedTransport(self.transport.clone()));
        }
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::Zero("sync_timeout_secs"));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Zero("max_line_length"));
        }
        if self.outbound_buffer < MIN_OUTBOUND_BUFFER {
            return Err(ConfigError::OutboundBufferTooSmall(self.outbound_buffer));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "127.0.0.1:3018");
        assert_eq!(config.sync_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "bind_address = \"0.0.0.0\"\nport = 4000\nsync_timeout_secs = 3\nlog_format = \"json\""
        )
        .unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:4000");
        assert_eq!(config.sync_timeout(), Duration::from_secs(3));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.max_snapshot_rows, RelayConfig::default().max_snapshot_rows);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            RelayConfig::load(Some(&missing)),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_validation() {
        let config = RelayConfig {
            transport: "udp".into(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedTransport(t)) if t == "udp"
        ));

        let config = RelayConfig {
            sync_timeout_secs: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("sync_timeout_secs"))));

        let config = RelayConfig {
            outbound_buffer: 1,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutboundBufferTooSmall(1))
        ));
    }
}
