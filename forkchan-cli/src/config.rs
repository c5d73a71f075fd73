//! Configuration loading from forkchan.toml
//!
//! The configuration is automatically discovered by walking up from the current directory.
//! Command-line flags override anything set here.

use anyhow::Context;
use forkchan_ipc::Transport;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file searched for during discovery
pub const CONFIG_FILE_NAME: &str = "forkchan.toml";

/// forkchan configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ForkchanConfig {
    /// Channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport used for the result channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Anonymous pipe (default)
    #[default]
    Pipe,
    /// Unix-domain socket pair
    SocketPair,
}

impl From<TransportMode> for Transport {
    fn from(mode: TransportMode) -> Self {
        match mode {
            TransportMode::Pipe => Transport::Pipe,
            TransportMode::SocketPair => Transport::SocketPair,
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Transport: "pipe" or "socket-pair"
    #[serde(default)]
    pub transport: TransportMode,
    /// How long the parent waits for the child's result (e.g., "5s", "500ms"); "0s" waits forever
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> String {
    "5s".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Enable debug logging
    #[serde(default)]
    pub verbose: bool,
    /// Explicit tracing filter directive, overrides `verbose`
    #[serde(default)]
    pub filter: Option<String>,
}

impl ForkchanConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let dir = std::env::current_dir().ok()?;
        Self::discover_from(&dir)
    }

    /// Walk up from `start` looking for `forkchan.toml`; an invalid file is
    /// logged and replaced by defaults
    pub fn discover_from(start: &Path) -> Option<Self> {
        match Self::try_discover_from(start) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    error = %format_args!("{:#}", e),
                    "ignoring invalid configuration, using defaults"
                );
                None
            }
        }
    }

    /// Walk up from `start` looking for `forkchan.toml`, failing if the
    /// nearest one cannot be parsed
    pub fn try_discover_from(start: &Path) -> anyhow::Result<Option<Self>> {
        let mut dir = start.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path)
                    .with_context(|| format!("Invalid config {}", config_path.display()))
                    .map(Some);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    /// Receive deadline, `None` when disabled
    pub fn receive_timeout(&self) -> anyhow::Result<Option<Duration>> {
        let nanos = Self::parse_duration(&self.channel.timeout)?;
        Ok((nanos > 0).then(|| Duration::from_nanos(nanos)))
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# forkchan Configuration

[channel]
# Transport for the result channel: "pipe" or "socket-pair"
transport = "pipe"
# How long the parent waits for the child's result ("0s" waits forever)
timeout = "5s"

[logging]
# Enable debug logging
verbose = false
# Explicit tracing filter (uncomment to enable)
# filter = "forkchan=trace"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m") to nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if value < 0.0 || !value.is_finite() {
            return Err(anyhow::anyhow!("Invalid duration number: {}", num_part));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForkchanConfig::default();
        assert_eq!(config.channel.transport, TransportMode::Pipe);
        assert_eq!(config.channel.timeout, "5s");
        assert!(!config.logging.verbose);
        assert_eq!(
            config.receive_timeout().unwrap(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(ForkchanConfig::parse_duration("3s").unwrap(), 3_000_000_000);
        assert_eq!(ForkchanConfig::parse_duration("500ms").unwrap(), 500_000_000);
        assert_eq!(ForkchanConfig::parse_duration("100us").unwrap(), 100_000);
        assert_eq!(ForkchanConfig::parse_duration("1000ns").unwrap(), 1000);
        assert_eq!(ForkchanConfig::parse_duration("2m").unwrap(), 120_000_000_000);
        assert_eq!(ForkchanConfig::parse_duration("1.5s").unwrap(), 1_500_000_000);
        assert_eq!(ForkchanConfig::parse_duration("7").unwrap(), 7_000_000_000);
        assert!(ForkchanConfig::parse_duration("").is_err());
        assert!(ForkchanConfig::parse_duration("5 fortnights").is_err());
        assert!(ForkchanConfig::parse_duration("-1s").is_err());
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let mut config = ForkchanConfig::default();
        config.channel.timeout = "0s".to_string();
        assert_eq!(config.receive_timeout().unwrap(), None);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [channel]
            transport = "socket-pair"

            [logging]
            verbose = true
        "#;

        let config: ForkchanConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.channel.transport, TransportMode::SocketPair);
        assert_eq!(Transport::from(config.channel.transport), Transport::SocketPair);
        assert!(config.logging.verbose);
        // Defaults should still apply
        assert_eq!(config.channel.timeout, "5s");
    }

    #[test]
    fn test_default_toml_parses() {
        let default_toml = ForkchanConfig::default_toml();
        let config: ForkchanConfig = toml::from_str(&default_toml).unwrap();
        assert_eq!(config.channel.transport, TransportMode::Pipe);
        assert_eq!(config.channel.timeout, "5s");
    }

    #[test]
    fn test_discover_walks_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "[channel]\ntimeout = \"250ms\"\n",
        )
        .unwrap();
        let nested = root.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = ForkchanConfig::discover_from(&nested).unwrap();
        assert_eq!(
            config.receive_timeout().unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_discover_invalid_file_falls_back() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "[channel]\ntransport = 42\n",
        )
        .unwrap();
        let nested = root.path().join("deeper");
        std::fs::create_dir_all(&nested).unwrap();

        assert!(ForkchanConfig::discover_from(&nested).is_none());
        let err = ForkchanConfig::try_discover_from(&nested).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_discover_without_file() {
        let root = tempfile::tempdir().unwrap();
        // A forkchan.toml further up (outside the temp dir) would be found, so
        // only check that discovery does not fail on an empty tree.
        let _ = ForkchanConfig::discover_from(root.path());
    }
}
