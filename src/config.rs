use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LogConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// Session store location and tuning
    pub store: StoreSettings,

    /// Set aggregation behaviour
    pub engine: EngineSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database file
    pub database_path: PathBuf,

    /// How long a writer waits on a locked database
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Load-apply-save attempts per mutating call before a version
    /// conflict is reported to the caller
    pub max_save_attempts: u32,

    /// Keep exercise rules in memory until invalidated
    pub cache_rules: bool,

    /// Idle time after which an Active set is reported as stale
    pub stale_after_minutes: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            metadata: ConfigMetadata {
                version: "1.0".to_string(),
                created_at: now,
                updated_at: now,
            },
            store: StoreSettings::default(),
            engine: EngineSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: AppConfig::data_dir().join("repcoach.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_save_attempts: 5,
            cache_rules: true,
            stale_after_minutes: 120,
        }
    }
}

/// Configuration management implementation
impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        // Update modification timestamp
        self.metadata.updated_at = Utc::now();

        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Directory holding the config file and the default database
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".repcoach")
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// Load the default config file, or defaults when none has been written
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to default location
    pub fn save_default(&mut self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to_file(config_path)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_save_attempts == 0 {
            anyhow::bail!("engine.max_save_attempts must be at least 1");
        }
        if self.engine.stale_after_minutes <= 0 {
            anyhow::bail!("engine.stale_after_minutes must be positive");
        }
        Ok(())
    }
}
