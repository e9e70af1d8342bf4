//! Runtime configuration for the identity and access-control engine.
//!
//! Loaded from a TOML file; every key is optional.
//!
//! ```toml
//! database_path = "/var/lib/topicgate/user.db"
//! default_read = true
//! default_write = false
//! token_ttl_secs = 259200
//! stats_flush_interval_secs = 33
//! token_sweep_interval_secs = 3600
//! password_hash_rounds = 100000
//! ```

use crate::auth::password::DEFAULT_HASH_ROUNDS;
use crate::auth::stats::DEFAULT_STATS_FLUSH_INTERVAL_SECS;
use crate::auth::tokens::DEFAULT_TOKEN_TTL_SECS;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default database file name, relative to the working directory.
const DEFAULT_DATABASE_PATH: &str = "user.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// SQLite file holding users, grants, tokens and stats.
    pub database_path: PathBuf,
    /// Allow reads on topics no grant matches.
    pub default_read: bool,
    /// Allow writes on topics no grant matches.
    pub default_write: bool,
    /// Token validity window.
    pub token_ttl_secs: u64,
    /// How often pending user stats are written.
    pub stats_flush_interval_secs: u64,
    /// How often expired tokens are swept. 0 leaves sweeping to the caller.
    pub token_sweep_interval_secs: u64,
    /// PBKDF2 rounds for new password hashes.
    pub password_hash_rounds: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            default_read: false,
            default_write: false,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            stats_flush_interval_secs: DEFAULT_STATS_FLUSH_INTERVAL_SECS,
            token_sweep_interval_secs: 0,
            password_hash_rounds: DEFAULT_HASH_ROUNDS,
        }
    }
}

impl AuthConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-user config location, e.g. `~/.config/topicgate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "topicgate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.password_hash_rounds == 0 {
            bail!("password_hash_rounds must be greater than 0");
        }
        if self.token_ttl_secs == 0 {
            bail!("token_ttl_secs must be greater than 0");
        }
        if self.stats_flush_interval_secs == 0 {
            bail!("stats_flush_interval_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs(self.stats_flush_interval_secs)
    }

    /// `None` when sweeping is left to an external scheduler.
    pub fn token_sweep_interval(&self) -> Option<Duration> {
        (self.token_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.token_sweep_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_deny_everything() {
        let config = AuthConfig::default();
        assert!(!config.default_read);
        assert!(!config.default_write);
        assert_eq!(config.token_ttl_secs, 72 * 3600);
        assert!(config.token_sweep_interval().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "default_read = true\nstats_flush_interval_secs = 5\ntoken_sweep_interval_secs = 60\n",
        )
        .unwrap();

        let config = AuthConfig::load(&path).unwrap();
        assert!(config.default_read);
        assert!(!config.default_write);
        assert_eq!(config.stats_flush_interval(), Duration::from_secs(5));
        assert_eq!(config.token_sweep_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.password_hash_rounds, DEFAULT_HASH_ROUNDS);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "default_reed = true\n").unwrap();
        assert!(AuthConfig::load(&path).is_err());
    }

    #[test]
    fn zero_rounds_are_rejected() {
        let config = AuthConfig {
            password_hash_rounds: 0,
            ..AuthConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = AuthConfig::load(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
