//! Runtime Configuration
//!
//! Interpreter settings, read from the `[interpreter]` table of a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Interpreter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes reserved for execution frames
    pub stack_size: usize,
    /// Node visits allowed per top-level call
    pub max_steps: u32,
    /// Type passed to event functions as the world
    pub world_type: String,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            stack_size: 64 * 1024,
            max_steps: 1_000_000,
            world_type: "World".to_string(),
        }
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_world_type(mut self, world_type: &str) -> Self {
        self.world_type = world_type.to_string();
        self
    }

    /// Parse the `[interpreter]` table of a TOML document. A missing table
    /// yields the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            interpreter: RuntimeConfig,
        }

        let file: File = toml::from_str(content)?;
        file.interpreter.validate()?;
        Ok(file.interpreter)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            stack_size = config.stack_size,
            max_steps = config.max_steps,
            "Loaded runtime config"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size == 0 {
            return Err(ConfigError::Invalid("stack_size must be greater than zero".into()));
        }
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be greater than zero".into()));
        }
        if self.world_type.is_empty() {
            return Err(ConfigError::Invalid("world_type must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
