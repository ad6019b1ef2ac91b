//! Settings and declaration loading

use anyhow::{Context, Result};
use fleetkit::{DeclarationDocument, EngineSettings, ResourceDeclaration};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "config.toml";

/// User settings from `config.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between wait polls
    pub poll_interval: u64,
    /// Seconds before retrying a launch rejected for an unknown instance profile
    pub auth_retry_delay: u64,
    /// Simulated cloud file; `~` and env vars are expanded
    pub cloud_file: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            poll_interval: engine.poll_interval.as_secs(),
            auth_retry_delay: engine.auth_retry_delay.as_secs(),
            cloud_file: None,
        }
    }
}

impl Settings {
    /// Load settings from the config directory, or defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_dir()?.join(SETTINGS_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))
    }

    pub fn engine(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            auth_retry_delay: Duration::from_secs(self.auth_retry_delay),
        }
    }

    /// Where the simulated cloud is kept; a command-line path wins
    pub fn cloud_path(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match &self.cloud_file {
            Some(file) => Ok(paths::expand(file)),
            None => paths::default_cloud_file(),
        }
    }
}

/// Read and validate a declaration document
pub fn load_declaration(path: &Path) -> Result<ResourceDeclaration> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read declaration: {}", path.display()))?;
    let document: DeclarationDocument = toml::from_str(&content)
        .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
    ResourceDeclaration::try_from(document)
        .with_context(|| format!("Invalid declaration in {}", path.display()))
}
