//! Application configuration.
//!
//! Settings load from a TOML file and may be overridden by CLI flags. All
//! validation happens before any voting task is spawned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Network;

/// Configuration errors surfaced before a run starts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A setting failed validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application configuration, merged from file and flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the ticket-vote server, e.g. `https://vote.example.org`.
    pub host: String,

    /// Directory journals are written under.
    pub vote_dir: PathBuf,

    /// Path of the local lookup cache database.
    pub cache_path: PathBuf,

    /// Hours a cached record stays fresh.
    pub cache_timeout_hours: u64,

    /// `host:port` of the wallet gRPC endpoint.
    pub wallet_host: String,

    /// Wallet server TLS certificate (PEM).
    pub wallet_cert: PathBuf,

    /// Client TLS certificate for wallet authentication (PEM).
    pub client_cert: PathBuf,

    /// Client TLS key for wallet authentication (PEM).
    pub client_key: PathBuf,

    /// Wallet passphrase. Prompted for interactively when unset.
    pub wallet_passphrase: Option<String>,

    /// Duration to spread votes over. Zero means "remaining window minus
    /// `hours_prior`", which must come out to at least 24 hours.
    #[serde(with = "humantime_serde")]
    pub vote_duration: Duration,

    /// Safety margin kept before the voting window closes when the duration
    /// is auto-computed.
    #[serde(with = "humantime_serde")]
    pub hours_prior: Duration,

    /// Use the truncated-Gaussian time distribution instead of bunches.
    pub gaussian: bool,

    /// Standard deviation squared for the Gaussian distribution.
    pub gaussian_deviate: f64,

    /// Number of bunches for the bunched distribution. One or fewer selects
    /// a plain uniform spread.
    pub bunches: u32,

    /// Columns of the diagnostic distribution chart.
    pub chart_cols: usize,

    /// Rows of the diagnostic distribution chart.
    pub chart_rows: usize,

    /// Shift the effective start time back by the elapsed part of the vote.
    pub resume: bool,

    /// Fabricate this many eligible tickets and never contact the server.
    pub emulate_vote: u32,

    /// Minutes between periodic progress printouts while trickling. Zero
    /// disables the table.
    pub interval_stats_minutes: u64,

    /// Skip TLS verification of the vote server. Testing only.
    pub skip_verify: bool,

    /// Network name: `mainnet` or `testnet`.
    pub network: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "https://proposals.example.org".to_string(),
            vote_dir: PathBuf::from("votes"),
            cache_path: PathBuf::from("cache"),
            cache_timeout_hours: 24,
            wallet_host: "127.0.0.1:9111".to_string(),
            wallet_cert: PathBuf::from("wallet.cert"),
            client_cert: PathBuf::from("client.pem"),
            client_key: PathBuf::from("client-key.pem"),
            wallet_passphrase: None,
            vote_duration: Duration::ZERO,
            hours_prior: Duration::from_secs(12 * 60 * 60),
            gaussian: false,
            gaussian_deviate: 1.0,
            bunches: 6,
            chart_cols: 60,
            chart_rows: 10,
            resume: false,
            emulate_vote: 0,
            interval_stats_minutes: 0,
            skip_verify: false,
            network: "mainnet".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] on IO or
    /// syntax problems.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolves the configured network.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown network names.
    pub fn network(&self) -> Result<Network, ConfigError> {
        Network::from_name(&self.network)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown network {:?}", self.network)))
    }

    /// Validates settings that do not depend on server state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network()?;
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must be set".to_string()));
        }
        if self.gaussian && self.gaussian_deviate <= 0.0 {
            return Err(ConfigError::Invalid(
                "gaussian_deviate must be positive".to_string(),
            ));
        }
        if self.chart_cols == 0 {
            return Err(ConfigError::Invalid("chart_cols must be positive".to_string()));
        }
        if self.cache_timeout_hours == 0 {
            return Err(ConfigError::Invalid(
                "cache_timeout_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL of the local lookup cache.
    #[must_use]
    pub const fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_hours * 60 * 60)
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn durations_parse_as_humantime() {
        let cfg: Config = toml::from_str(
            r#"
            vote_duration = "6h"
            hours_prior = "2h 30m"
            network = "testnet"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.vote_duration, Duration::from_secs(6 * 3600));
        assert_eq!(cfg.hours_prior, Duration::from_secs(9000));
        assert_eq!(cfg.network().unwrap().name, "testnet");
    }

    #[test]
    fn unknown_network_is_rejected() {
        let cfg = Config {
            network: "simnet".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str("votedur = \"1h\"");
        assert!(parsed.is_err());
    }
}
