// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Storage collaborator
//!
//! Every call is atomic on its own; callers must not assume exclusivity
//! across calls since producers and the executer share one storage.

mod sqlite;

pub use sqlite::SqliteStorage;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::alert::{SensorAlert, SensorData, SensorDataType, SensorState};

/// Option key holding the active profile id
pub const PROFILE_OPTION: &str = "profile";

/// Persisted sensor with its authoritative state and data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Server-wide sensor id
    pub sensor_id: i64,
    /// Node the sensor belongs to
    pub node_id: i64,
    /// Sensor description
    pub description: String,
    /// Alert delay in seconds
    pub alert_delay: i64,
    /// Alert levels the sensor is wired to
    pub alert_levels: Vec<u32>,
    /// Last persisted state
    pub state: SensorState,
    /// Type tag of `data`
    pub data_type: SensorDataType,
    /// Last persisted data
    pub data: SensorData,
}

/// Storage collaborator of the executer and manager
pub trait Storage: Send + Sync {
    /// Persist a new sensor alert and return its id
    fn add_sensor_alert(&self, sensor_alert: &SensorAlert) -> Result<i64>;

    /// All sensor alerts not yet finalized. Rows that cannot be decoded are
    /// removed and not returned.
    fn get_pending_sensor_alerts(&self) -> Result<Vec<SensorAlert>>;

    /// Remove a sensor alert. Removing an unknown id is not an error.
    fn remove_sensor_alert(&self, sensor_alert_id: i64) -> Result<()>;

    /// Sensor by id
    fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>>;

    /// All sensors
    fn get_sensors(&self) -> Result<Vec<Sensor>>;

    /// Persisted state of a sensor
    fn get_sensor_state(&self, sensor_id: i64) -> Result<SensorState>;

    /// Persisted data of a sensor
    fn get_sensor_data(&self, sensor_id: i64) -> Result<SensorData>;

    /// Option value by key
    fn get_option(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace an option
    fn update_option(&self, key: &str, value: &str) -> Result<()>;
}

/// Read the active profile id from the `profile` option
pub fn active_profile(storage: &dyn Storage) -> Result<u32> {
    let value = storage
        .get_option(PROFILE_OPTION)?
        .ok_or_else(|| anyhow::anyhow!("option '{}' not set", PROFILE_OPTION))?;
    let profile = value
        .trim()
        .parse::<u32>()
        .map_err(|e| anyhow::anyhow!("option '{}' is not a profile id: {}", PROFILE_OPTION, e))?;
    Ok(profile)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_sensor(sensor_id: i64, alert_levels: Vec<u32>) -> Sensor {
        Sensor {
            sensor_id,
            node_id: 2,
            description: format!("Sensor {}", sensor_id),
            alert_delay: 0,
            alert_levels,
            state: SensorState::Normal,
            data_type: SensorDataType::None,
            data: SensorData::none(),
        }
    }
}
