// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Alert level and profile rules

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::sensor_alert::SensorState;

/// A named operating mode of the whole system (e.g. Home, Away, Night)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile id, referenced by alert levels and the `profile` option
    pub id: u32,

    /// Human readable name
    pub name: String,
}

/// External program run per (sensor alert, alert level) pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Program to execute
    pub cmd: PathBuf,

    /// Extra arguments passed before the payload is written to stdin
    #[serde(default)]
    pub args: Vec<String>,

    /// Hard timeout in seconds after which the program is killed
    pub timeout_secs: u64,
}

impl InstrumentationConfig {
    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A rule binding sensors to actions, gated by profile and trigger direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertLevel {
    /// Unique alert level id
    pub level: u32,

    /// Alert level name
    pub name: String,

    /// React regardless of the direction of the sensor alert
    #[serde(default)]
    pub trigger_always: bool,

    /// React to sensor alerts for state "triggered"
    #[serde(default)]
    pub trigger_on_triggered: bool,

    /// React to sensor alerts for state "normal"
    #[serde(default)]
    pub trigger_on_normal: bool,

    /// Profiles this alert level is armed under
    pub profiles: Vec<u32>,

    /// Instrumentation settings, present iff instrumentation is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrumentation: Option<InstrumentationConfig>,
}

impl AlertLevel {
    /// Alert level armed under profile 0, reacting to "triggered" only
    pub fn new(level: u32, name: &str) -> Self {
        Self {
            level,
            name: name.to_string(),
            trigger_always: false,
            trigger_on_triggered: true,
            trigger_on_normal: false,
            profiles: vec![0],
            instrumentation: None,
        }
    }

    /// Is an instrumentation configured?
    pub fn instrumentation_active(&self) -> bool {
        self.instrumentation.is_some()
    }

    /// Is this alert level armed under the given profile?
    pub fn is_armed(&self, profile: u32) -> bool {
        self.profiles.contains(&profile)
    }

    /// Does this alert level react to a sensor alert with the given state?
    pub fn reacts_to(&self, state: SensorState) -> bool {
        if self.trigger_always {
            return true;
        }
        match state {
            SensorState::Triggered => self.trigger_on_triggered,
            SensorState::Normal => self.trigger_on_normal,
        }
    }

    /// Profile gating followed by the trigger-direction check
    pub fn qualifies(&self, profile: u32, state: SensorState) -> bool {
        self.is_armed(profile) && self.reacts_to(state)
    }
}
