// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Final alert dispatch

use std::sync::Arc;
use tracing::info;

use super::level::AlertLevel;
use super::sensor_alert::SensorAlert;
use crate::core::{EventBus, TriggeredAlert};

/// Fires the actions bound to an alert level.
///
/// Fire-and-forget: failures are the dispatcher's business and never reach
/// the executer.
pub trait AlertDispatcher: Send + Sync {
    /// Act on one triggered alert level
    fn trigger(&self, alert_level: &AlertLevel, sensor_alert: &SensorAlert);
}

/// Publishes every triggered alert level on the event bus
pub struct EventBusDispatcher {
    bus: Arc<EventBus>,
}

impl EventBusDispatcher {
    /// Create a new instance
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl AlertDispatcher for EventBusDispatcher {
    fn trigger(&self, alert_level: &AlertLevel, sensor_alert: &SensorAlert) {
        info!(
            alert_level = alert_level.level,
            sensor_alert_id = sensor_alert.sensor_alert_id,
            sensor_id = sensor_alert.sensor_id,
            "Alert level '{}' triggered by '{}'",
            alert_level.name,
            sensor_alert.description
        );

        self.bus.publish_triggered(TriggeredAlert {
            alert_level: alert_level.level,
            alert_level_name: alert_level.name.clone(),
            sensor_alert: sensor_alert.clone(),
        });
    }
}
