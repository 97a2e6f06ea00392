// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Configuration module

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::alert::{AlertLevel, Profile};

/// Invalid alert level or profile configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No profile configured
    #[error("no profiles configured")]
    NoProfiles,

    /// Profile id used twice
    #[error("profile {0} configured more than once")]
    DuplicateProfile(u32),

    /// Alert level id used twice
    #[error("alert level {0} configured more than once")]
    DuplicateAlertLevel(u32),

    /// Alert level armed under no profile
    #[error("alert level {0} has no profiles")]
    AlertLevelWithoutProfiles(u32),

    /// Alert level references a profile that does not exist
    #[error("alert level {level} references unknown profile {profile}")]
    UnknownProfile {
        /// Offending alert level
        level: u32,
        /// Missing profile id
        profile: u32,
    },

    /// Instrumentation without a command
    #[error("alert level {0} has an empty instrumentation command")]
    EmptyInstrumentationCmd(u32),

    /// Instrumentation timeout of zero
    #[error("alert level {0} needs an instrumentation timeout greater than zero")]
    InvalidInstrumentationTimeout(u32),

    /// Internal sensor wired to an unknown alert level
    #[error("internal sensor references unknown alert level {0}")]
    UnknownInternalSensorAlertLevel(u32),

    /// Setting out of range
    #[error("invalid setting: {0} must be greater than zero")]
    InvalidSetting(&'static str),
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Application version
    pub version: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level used when no command line flag overrides it
    pub log_level: String,

    /// Sensor alert executer settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Manager update settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Internal sensors raised by the server itself
    #[serde(default)]
    pub internal_sensors: InternalSensorsConfig,

    /// System profiles
    pub profiles: Vec<Profile>,

    /// Alert levels
    #[serde(default)]
    pub alert_levels: Vec<AlertLevel>,
}

impl Default for Config {
    fn default() -> Self {
        let mut notify = AlertLevel::new(1, "Notify");
        notify.profiles = vec![0, 1];

        Self {
            app_name: "AlertR".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
            manager: ManagerConfig::default(),
            database: DatabaseConfig::default(),
            internal_sensors: InternalSensorsConfig::default(),
            profiles: vec![
                Profile {
                    id: 0,
                    name: "Home".to_string(),
                },
                Profile {
                    id: 1,
                    name: "Away".to_string(),
                },
            ],
            alert_levels: vec![notify],
        }
    }
}

impl Config {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("alertr"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Look up a configured profile
    pub fn profile(&self, id: u32) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }

        let mut profile_ids = HashSet::new();
        for profile in &self.profiles {
            if !profile_ids.insert(profile.id) {
                return Err(ConfigError::DuplicateProfile(profile.id));
            }
        }

        let mut levels = HashSet::new();
        for alert_level in &self.alert_levels {
            if !levels.insert(alert_level.level) {
                return Err(ConfigError::DuplicateAlertLevel(alert_level.level));
            }
            if alert_level.profiles.is_empty() {
                return Err(ConfigError::AlertLevelWithoutProfiles(alert_level.level));
            }
            if let Some(&profile) = alert_level.profiles.iter().find(|p| !profile_ids.contains(*p)) {
                return Err(ConfigError::UnknownProfile {
                    level: alert_level.level,
                    profile,
                });
            }
            if let Some(instrumentation) = &alert_level.instrumentation {
                if instrumentation.cmd.as_os_str().is_empty() {
                    return Err(ConfigError::EmptyInstrumentationCmd(alert_level.level));
                }
                if instrumentation.timeout_secs == 0 {
                    return Err(ConfigError::InvalidInstrumentationTimeout(alert_level.level));
                }
            }
        }

        if let Some(sensor) = &self.internal_sensors.instrumentation_error {
            if let Some(&level) = sensor.alert_levels.iter().find(|l| !levels.contains(*l)) {
                return Err(ConfigError::UnknownInternalSensorAlertLevel(level));
            }
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting("engine.poll_interval_ms"));
        }
        if self.engine.idle_wait_secs == 0 {
            return Err(ConfigError::InvalidSetting("engine.idle_wait_secs"));
        }
        if self.engine.max_concurrent_instrumentations == 0 {
            return Err(ConfigError::InvalidSetting("engine.max_concurrent_instrumentations"));
        }
        if self.engine.event_capacity == 0 {
            return Err(ConfigError::InvalidSetting("engine.event_capacity"));
        }
        if self.manager.update_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting("manager.update_interval_secs"));
        }

        Ok(())
    }
}

/// Sensor alert executer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pass cadence while sensor alerts are pending, in milliseconds
    pub poll_interval_ms: u64,

    /// Longest wait for a wake signal while idle, in seconds
    pub idle_wait_secs: u64,

    /// Size of the instrumentation worker pool
    pub max_concurrent_instrumentations: usize,

    /// Capacity of the event bus channels
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            idle_wait_secs: 10,
            max_concurrent_instrumentations: 8,
            event_capacity: 1000,
        }
    }
}

impl EngineConfig {
    /// Pass cadence while states are pending
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Longest idle wait
    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }
}

/// Manager update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Interval of full status updates in seconds
    pub update_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
        }
    }
}

impl ManagerConfig {
    /// Interval of full status updates
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database path
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/alertr.db"),
        }
    }
}

/// Internal sensors of the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalSensorsConfig {
    /// Raises a sensor alert whenever an instrumentation fails
    pub instrumentation_error: Option<InternalSensorConfig>,
}

/// Sensor row registered for an internal sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalSensorConfig {
    /// Node the sensor is registered under
    pub node_id: i64,
    /// Server-wide sensor id
    pub sensor_id: i64,
    /// Sensor description
    pub description: String,
    /// Alert delay of raised sensor alerts in seconds
    #[serde(default)]
    pub alert_delay: i64,
    /// Alert levels raised sensor alerts are wired to
    pub alert_levels: Vec<u32>,
}
