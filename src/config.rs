// Runtime configuration, built once at startup and passed into the
// dataset store, the engine and the server. Never mutated afterwards.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ReconcileError, Result};

pub const ENV_DATABASE: &str = "VOTE_RECONCILE_DB";
pub const ENV_VOTES_DIR: &str = "VOTE_RECONCILE_VOTES_DIR";
pub const ENV_BIND: &str = "VOTE_RECONCILE_BIND";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database holding raw results, the change table and the views
    pub database_path: PathBuf,

    /// Directory with one result file per voting date
    pub votes_dir: PathBuf,

    /// File name = prefix + YYYYMMDD + suffix
    pub dataset_prefix: String,
    pub dataset_suffix: String,

    /// Keep parsed datasets in memory (they are immutable once published)
    pub cache_datasets: bool,

    pub bind_addr: String,

    /// Used when RUST_LOG is not set
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("data/swiss_votings.db"),
            votes_dir: PathBuf::from("data/votes"),
            dataset_prefix: "sd-t-17-02-".to_string(),
            dataset_suffix: "-eidgAbstimmung.json".to_string(),
            cache_datasets: true,
            bind_addr: "0.0.0.0:3000".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ReconcileError::Config(e.to_string()))
    }

    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ReconcileError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides; the lookup is injected so tests stay hermetic.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DATABASE) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(dir) = lookup(ENV_VOTES_DIR) {
            self.votes_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind_addr = bind;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset_prefix.is_empty() && self.dataset_suffix.is_empty() {
            return Err(ReconcileError::Config(
                "dataset_prefix and dataset_suffix cannot both be empty".to_string(),
            ));
        }
        if self.dataset_prefix.contains('/') || self.dataset_suffix.contains('/') {
            return Err(ReconcileError::Config(
                "dataset naming must not contain path separators".to_string(),
            ));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(ReconcileError::Config("bind_addr is empty".to_string()));
        }
        Ok(())
    }
}
