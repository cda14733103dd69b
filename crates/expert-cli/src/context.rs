//! Shared command context: config, state store, provider construction.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use repo_expert::config::Config;
use repo_expert::provider::{LettaProvider, Provider, Retrying};
use repo_expert::state::{DEFAULT_STATE_FILE, StateStore};

/// Global flags shared by every command.
pub struct Context {
    pub config_path: PathBuf,
    pub state_path: Option<PathBuf>,
    pub json: bool,
}

impl Context {
    /// Load and validate the config file.
    pub fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_path).map_err(anyhow::Error::from)
    }

    /// The state store for this invocation.
    pub fn store(&self) -> StateStore {
        let path = self
            .state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
        StateStore::new(path)
    }

    /// Build the retry-wrapped provider from config.
    pub fn provider(&self, config: &Config) -> Result<Arc<dyn Provider>> {
        let letta = LettaProvider::new(&config.provider)
            .context("failed to construct the provider client")?;
        Ok(Arc::new(Retrying::new(letta)))
    }

    /// The repos a command should operate on: the named ones, or all.
    pub fn select_repos<'a>(&self, config: &'a Config, named: &[String]) -> Result<Vec<&'a str>> {
        if named.is_empty() {
            return Ok(config.repos.keys().map(String::as_str).collect());
        }
        let mut out = Vec::with_capacity(named.len());
        for name in named {
            let key = config
                .repos
                .get_key_value(name.as_str())
                .map(|(k, _)| k.as_str())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "unknown repo `{name}`\n  Declared repos: {}",
                        config.repos.keys().cloned().collect::<Vec<_>>().join(", ")
                    )
                })?;
            out.push(key);
        }
        Ok(out)
    }
}
