// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Sensors raised by the server itself

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::alert::{
    AlertLevel, ExecuterHandle, InstrumentationError, InstrumentationErrorReporter, NewSensorAlert,
    SensorData, SensorDataType, SensorState,
};
use crate::config::InternalSensorConfig;
use crate::storage::{Sensor, SqliteStorage};

/// Raises a triggered sensor alert whenever an alert level instrumentation
/// fails
pub struct InstrumentationErrorSensor {
    config: InternalSensorConfig,
    executer: ExecuterHandle,
}

impl InstrumentationErrorSensor {
    /// Create a new instance
    pub fn new(config: InternalSensorConfig, executer: ExecuterHandle) -> Self {
        Self { config, executer }
    }

    /// Register the sensor row so its sensor alerts resolve like any other
    pub fn register(&self, storage: &SqliteStorage) -> Result<()> {
        storage.upsert_sensor(&Sensor {
            sensor_id: self.config.sensor_id,
            node_id: self.config.node_id,
            description: self.config.description.clone(),
            alert_delay: self.config.alert_delay,
            alert_levels: self.config.alert_levels.clone(),
            state: SensorState::Normal,
            data_type: SensorDataType::None,
            data: SensorData::none(),
        })
    }

    /// Optional data describing the failure
    pub fn optional_data(alert_level: &AlertLevel, error: &InstrumentationError) -> Value {
        let (cmd, timeout) = alert_level
            .instrumentation
            .as_ref()
            .map(|i| (i.cmd.display().to_string(), i.timeout_secs))
            .unwrap_or_default();

        let message = match error {
            InstrumentationError::NotConfigured(_)
            | InstrumentationError::Spawn(_)
            | InstrumentationError::Io(_) => {
                format!("Executing instrumentation for Alert Level '{}' failed.", alert_level.level)
            }
            InstrumentationError::ExitCode { exit_code, .. } => format!(
                "Instrumentation for Alert Level '{}' exited with exit code '{}'.",
                alert_level.level, exit_code
            ),
            InstrumentationError::InvalidOutput(_) => format!(
                "Unable to process output from instrumentation for Alert Level '{}'.",
                alert_level.level
            ),
            InstrumentationError::EmptyOutput { .. } => {
                format!("No output for instrumentation for Alert Level '{}'.", alert_level.level)
            }
            InstrumentationError::Timeout { .. } => {
                format!("Instrumentation for Alert Level '{}' timed out.", alert_level.level)
            }
        };

        let mut data = json!({
            "message": message,
            "alert_level": alert_level.level,
            "instrumentation_cmd": cmd,
            "instrumentation_timeout": timeout,
        });
        if let (InstrumentationError::ExitCode { exit_code, .. }, Value::Object(map)) = (error, &mut data) {
            map.insert("exit_code".to_string(), json!(exit_code));
        }
        data
    }
}

impl InstrumentationErrorReporter for InstrumentationErrorSensor {
    fn report(&self, alert_level: &AlertLevel, error: &InstrumentationError) {
        debug!(
            alert_level = alert_level.level,
            "Triggering sensor alert for instrumentation error"
        );

        let result = self.executer.add_sensor_alert(NewSensorAlert {
            node_id: self.config.node_id,
            sensor_id: self.config.sensor_id,
            state: SensorState::Triggered,
            optional_data: Some(Self::optional_data(alert_level, error)),
            change_state: false,
            has_latest_data: false,
            data: None,
        });

        if let Err(e) = result {
            error!("Unable to add sensor alert for instrumentation error sensor: {}", e);
        }
    }
}
