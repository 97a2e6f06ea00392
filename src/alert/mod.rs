// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Sensor alert decision engine
//!
//! Data model, instrumentation and the executer that decides which alert
//! levels a sensor alert triggers under the active profile.

/// Alert dispatch seam
pub mod dispatch;
/// Executer loop and producer handle
pub mod executer;
/// External instrumentation programs
pub mod instrumentation;
/// Alert levels and profiles
pub mod level;
/// Instrumentation promise
pub mod promise;
/// Sensor alert data model
pub mod sensor_alert;
/// Per-event working state
pub mod state;

pub use dispatch::{AlertDispatcher, EventBusDispatcher};
pub use executer::{ExecuterHandle, ExecuterStats, NewSensorAlert, PassReport, SensorAlertExecuter};
pub use instrumentation::{
    Instrumentation, InstrumentationError, InstrumentationErrorReporter, InstrumentationRunner,
};
pub use level::{AlertLevel, InstrumentationConfig, Profile};
pub use promise::{InstrumentationPromise, PromiseError, PromiseState};
pub use sensor_alert::{SensorAlert, SensorAlertError, SensorData, SensorDataType, SensorState};
pub use state::{EvaluationSnapshot, SensorAlertState, StateError};
