// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! AlertR - Sensor Alert Decision Engine
//!
//! Sensors report triggered events to the server, which decides whether the
//! alert levels wired to the sensor fire, subject to:
//! - the active system profile (e.g. Home, Away, Night)
//! - the trigger direction configured per alert level
//! - an optional per alert level instrumentation program that can mutate or
//!   suppress the event
//! - a per sensor alert delay during which conditions are re-evaluated
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         AlertR Engine                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │ Producers │ → │   Storage    │ → │ Sensor Alert         │  │
//! │  │ (handle)  │   │   (SQLite)   │   │ Executer             │  │
//! │  └───────────┘   └──────────────┘   └──────────────────────┘  │
//! │        ↑                                 ↓            ↓       │
//! │  ┌───────────────┐   ┌─────────────────────┐  ┌────────────┐  │
//! │  │ Internal      │ ← │ Instrumentation     │  │ Manager    │  │
//! │  │ Sensors       │   │ Worker Pool         │  │ Updates    │  │
//! │  └───────────────┘   └─────────────────────┘  └────────────┘  │
//! │                                 ↓                   ↓         │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │                        Event Bus                        │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

/// Sensor alerts, alert levels, instrumentation and the executer
pub mod alert;
/// TOML configuration
pub mod config;
/// Engine wiring and event bus
pub mod core;
/// Sensors run by the server itself
pub mod internal_sensors;
/// Status updates for manager clients
pub mod manager;
/// Persistence of sensors, sensor alerts and options
pub mod storage;

// Re-exports for convenience
pub use crate::alert::{
    AlertDispatcher, AlertLevel, ExecuterHandle, NewSensorAlert, PassReport, Profile, SensorAlert,
    SensorAlertExecuter, SensorData, SensorState,
};
pub use crate::config::Config;
pub use crate::core::{Engine, EventBus};
pub use crate::manager::{ManagerUpdateExecuter, StateChangeQueue};
pub use crate::storage::{SqliteStorage, Storage};

/// AlertR version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// AlertR name
pub const NAME: &str = "AlertR";
