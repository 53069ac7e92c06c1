use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AlmanacError, Result};

/// The one environment variable that must always be present.
pub const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cloud project the datastore belongs to.
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Local database file. Empty means `<project>.db`.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub turso_url: String,
    #[serde(default)]
    pub turso_token: String,
}

impl DatabaseConfig {
    pub fn is_remote(&self) -> bool {
        !self.turso_url.is_empty()
    }
}

impl Config {
    /// Load config: defaults → almanac.toml → env vars (env wins).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| AlmanacError::Config(format!("failed to read config: {e}")))?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| AlmanacError::Config(format!("failed to parse config: {e}")))
    }

    /// Override fields from the environment, read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(PROJECT_ENV) {
            self.project = v;
        }
        if let Some(v) = lookup("ALMANAC_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("ALMANAC_TURSO_URL") {
            self.database.turso_url = v;
        }
        if let Some(v) = lookup("ALMANAC_TURSO_TOKEN") {
            self.database.turso_token = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(AlmanacError::Config(format!("{PROJECT_ENV} is not set")));
        }
        if self.database.is_remote() && self.database.turso_token.is_empty() {
            return Err(AlmanacError::Config(
                "turso_url is set but turso_token is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the local database file.
    pub fn database_path(&self) -> String {
        if self.database.path.is_empty() {
            format!("{}.db", self.project)
        } else {
            self.database.path.clone()
        }
    }
}
