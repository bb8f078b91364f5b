//! Child presets
//!
//! Loads named child configurations from .gpif/config.toml

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::session::SessionConfig;

/// Configuration file name
pub const CONFIG_DIR: &str = ".gpif";
pub const CONFIG_FILE: &str = "config.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A named way to launch a child
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChildPreset {
    /// Name of the preset
    pub name: String,
    /// Executable to run
    pub command: String,
    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Shutdown sequence, when the child does not understand `quit`
    pub quit_command: Option<String>,
    /// Put the child's stdin pipe into non-blocking mode
    #[serde(default)]
    pub nonblocking_input: bool,
}

impl ChildPreset {
    /// Build the session configuration this preset describes
    pub fn to_session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.command.as_str())
            .with_args(self.args.iter().cloned())
            .with_nonblocking_input(self.nonblocking_input);
        if let Some(quit) = &self.quit_command {
            config = config.with_quit_command(quit.as_str());
        }
        config
    }
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct GpifConfig {
    /// Child presets
    #[serde(default)]
    pub presets: Vec<ChildPreset>,
    /// Default preset name
    pub default_preset: Option<String>,
}

impl GpifConfig {
    /// Load configuration from a project directory
    pub fn load(project_path: &Path) -> Result<Self, ConfigError> {
        Self::load_from(&project_path.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: GpifConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get a preset by name
    pub fn get_preset(&self, name: &str) -> Option<&ChildPreset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Get the default preset
    pub fn default_preset(&self) -> Option<&ChildPreset> {
        self.default_preset
            .as_ref()
            .and_then(|name| self.get_preset(name))
    }
}
