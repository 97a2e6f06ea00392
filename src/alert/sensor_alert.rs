// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Sensor alert events and sensor data

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// State reported by a sensor ("normal" = 0, "triggered" = 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SensorState {
    /// State 0
    Normal,
    /// State 1
    Triggered,
}

impl SensorState {
    /// The opposite state
    pub fn toggled(self) -> Self {
        match self {
            SensorState::Normal => SensorState::Triggered,
            SensorState::Triggered => SensorState::Normal,
        }
    }
}

impl TryFrom<u8> for SensorState {
    type Error = SensorAlertError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SensorState::Normal),
            1 => Ok(SensorState::Triggered),
            other => Err(SensorAlertError::InvalidState(other as i64)),
        }
    }
}

impl From<SensorState> for u8 {
    fn from(state: SensorState) -> u8 {
        match state {
            SensorState::Normal => 0,
            SensorState::Triggered => 1,
        }
    }
}

/// Type tag of the data attached to a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SensorDataType {
    /// No data
    None,
    /// Integer value with unit
    Int,
    /// Float value with unit
    Float,
    /// GPS position
    Gps,
}

impl TryFrom<u8> for SensorDataType {
    type Error = SensorAlertError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SensorDataType::None),
            1 => Ok(SensorDataType::Int),
            2 => Ok(SensorDataType::Float),
            3 => Ok(SensorDataType::Gps),
            other => Err(SensorAlertError::InvalidDataType(other)),
        }
    }
}

impl From<SensorDataType> for u8 {
    fn from(data_type: SensorDataType) -> u8 {
        match data_type {
            SensorDataType::None => 0,
            SensorDataType::Int => 1,
            SensorDataType::Float => 2,
            SensorDataType::Gps => 3,
        }
    }
}

/// Data attached to a sensor or sensor alert.
///
/// Serialized without a tag; the shape is matched against the accompanying
/// [`SensorDataType`] by [`SensorAlert::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorData {
    /// GPS position
    Gps(GpsData),
    /// Integer reading
    Int(IntData),
    /// Float reading
    Float(FloatData),
    /// No data
    None(NoData),
}

/// GPS position with its UTC timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpsData {
    /// Latitude
    pub lat: f64,
    /// Longitude
    pub lon: f64,
    /// UTC seconds of the fix
    pub utctime: i64,
}

/// Integer reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntData {
    /// Value
    pub value: i64,
    /// Unit
    pub unit: String,
}

/// Float reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloatData {
    /// Value
    pub value: f64,
    /// Unit
    pub unit: String,
}

/// Empty payload of sensors without data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoData {}

impl SensorData {
    /// Data of a sensor without data
    pub fn none() -> Self {
        SensorData::None(NoData {})
    }

    /// Integer data
    pub fn int(value: i64, unit: &str) -> Self {
        SensorData::Int(IntData {
            value,
            unit: unit.to_string(),
        })
    }

    /// Float data
    pub fn float(value: f64, unit: &str) -> Self {
        SensorData::Float(FloatData {
            value,
            unit: unit.to_string(),
        })
    }

    /// GPS data
    pub fn gps(lat: f64, lon: f64, utctime: i64) -> Self {
        SensorData::Gps(GpsData { lat, lon, utctime })
    }

    /// Type tag matching this data
    pub fn data_type(&self) -> SensorDataType {
        match self {
            SensorData::None(_) => SensorDataType::None,
            SensorData::Int(_) => SensorDataType::Int,
            SensorData::Float(_) => SensorDataType::Float,
            SensorData::Gps(_) => SensorDataType::Gps,
        }
    }
}

impl Default for SensorData {
    fn default() -> Self {
        SensorData::none()
    }
}

impl fmt::Display for SensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorData::None(_) => write!(f, "None"),
            SensorData::Int(d) => write!(f, "{} {}", d.value, d.unit),
            SensorData::Float(d) => write!(f, "{} {}", d.value, d.unit),
            SensorData::Gps(d) => write!(f, "(Lat: {}, Lon: {}) at {}", d.lat, d.lon, d.utctime),
        }
    }
}

/// Invalid sensor alert content
#[derive(Debug, Error, PartialEq)]
pub enum SensorAlertError {
    /// State other than 0 or 1
    #[error("invalid sensor state {0}")]
    InvalidState(i64),

    /// Unknown data type tag
    #[error("invalid sensor data type {0}")]
    InvalidDataType(u8),

    /// Data shape does not match the data type
    #[error("sensor data does not match data type {0:?}")]
    DataMismatch(SensorDataType),

    /// `optionalData` not an object while `hasOptionalData` is set
    #[error("optional data must be an object when hasOptionalData is set")]
    InvalidOptionalData,

    /// Alert delay below zero
    #[error("negative alert delay {0}")]
    NegativeAlertDelay(i64),
}

/// One triggered or normal-state event reported by a sensor.
///
/// Cloning produces a deep, independent copy; derived copies created per
/// instrumented alert level never share data with the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorAlert {
    /// Storage row id. Engine bookkeeping only, not part of the JSON shape.
    #[serde(skip)]
    pub sensor_alert_id: i64,

    /// Node the origin sensor belongs to
    pub node_id: i64,
    /// Server-wide id of the origin sensor
    pub sensor_id: i64,

    /// Description of the sensor that raised this sensor alert
    pub description: String,

    /// UTC seconds at ingestion
    pub time_received: i64,

    /// Seconds to postpone the final decision
    pub alert_delay: i64,

    /// State 0 (normal) or 1 (triggered)
    pub state: SensorState,

    /// Is `optional_data` set?
    pub has_optional_data: bool,
    /// Opaque payload for instrumentation and notifications
    #[serde(default)]
    pub optional_data: Option<Value>,

    /// Does this sensor alert imply a persisted sensor state change?
    pub change_state: bool,

    /// Alert levels the origin sensor is wired to
    pub alert_levels: Vec<u32>,

    /// Alert levels currently triggered by this sensor alert
    #[serde(default)]
    pub triggered_alert_levels: Vec<u32>,

    /// Does this sensor alert carry the latest data of the sensor?
    pub has_latest_data: bool,

    /// Type tag of `data`
    pub data_type: SensorDataType,
    /// Sensor data
    pub data: SensorData,
}

impl SensorAlert {
    /// Is this a "triggered" sensor alert?
    pub fn is_triggered(&self) -> bool {
        self.state == SensorState::Triggered
    }

    /// Does this sensor alert require a status update if nothing triggers?
    pub fn reports_change(&self) -> bool {
        self.change_state || self.has_latest_data
    }

    /// Check the invariants serde alone cannot express
    pub fn validate(&self) -> Result<(), SensorAlertError> {
        if self.data.data_type() != self.data_type {
            return Err(SensorAlertError::DataMismatch(self.data_type));
        }

        if self.has_optional_data && !matches!(self.optional_data, Some(Value::Object(_))) {
            return Err(SensorAlertError::InvalidOptionalData);
        }

        if self.alert_delay < 0 {
            return Err(SensorAlertError::NegativeAlertDelay(self.alert_delay));
        }

        Ok(())
    }

    /// Is `level` one of the alert levels the origin sensor is wired to?
    pub fn belongs_to(&self, level: u32) -> bool {
        self.alert_levels.contains(&level)
    }

    /// Compare the wired alert levels as sets
    pub fn same_alert_levels(&self, other: &SensorAlert) -> bool {
        self.alert_levels.iter().all(|l| other.alert_levels.contains(l))
            && other.alert_levels.iter().all(|l| self.alert_levels.contains(l))
    }
}
