// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Event bus for inter-component communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::alert::SensorAlert;
use crate::manager::StateChange;
use crate::storage::Sensor;

/// Event types in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// An alert level triggered
    SensorAlertTriggered,
    /// Sensor state pushed to managers
    StateChange,
    /// Full status update
    StatusUpdate,
    /// Active profile switched
    ProfileChanged,
    /// Error report
    Error,
}

/// Generic event wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event id
    pub id: u64,
    /// Event kind
    pub event_type: EventType,
    /// Publish time
    pub timestamp: DateTime<Utc>,
    /// Event content
    pub payload: EventPayload,
}

/// An alert level fired for a sensor alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredAlert {
    /// Triggered alert level id
    pub alert_level: u32,
    /// Triggered alert level name
    pub alert_level_name: String,
    /// Sensor alert as dispatched
    pub sensor_alert: SensorAlert,
}

/// Event content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Triggered alert level
    Triggered(TriggeredAlert),
    /// Sensor state change
    StateChange(StateChange),
    /// All sensors with the active profile
    Status {
        /// Active profile, if readable
        profile: Option<u32>,
        /// All persisted sensors
        sensors: Vec<Sensor>,
    },
    /// New active profile
    Profile {
        /// Profile id
        profile: u32,
        /// Profile name
        name: String,
    },
    /// Error report
    Error {
        /// Error code
        code: u32,
        /// Human readable message
        message: String,
    },
}

impl EventPayload {
    fn event_type(&self) -> EventType {
        match self {
            EventPayload::Triggered(_) => EventType::SensorAlertTriggered,
            EventPayload::StateChange(_) => EventType::StateChange,
            EventPayload::Status { .. } => EventType::StatusUpdate,
            EventPayload::Profile { .. } => EventType::ProfileChanged,
            EventPayload::Error { .. } => EventType::Error,
        }
    }
}

/// Central event bus for pub/sub communication
pub struct EventBus {
    triggered_tx: broadcast::Sender<TriggeredAlert>,
    event_tx: broadcast::Sender<Event>,
    event_counter: AtomicU64,
}

impl EventBus {
    /// Bus with `capacity` buffered events per channel
    pub fn new(capacity: usize) -> Self {
        let (triggered_tx, _) = broadcast::channel(capacity.max(1));
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            triggered_tx,
            event_tx,
            event_counter: AtomicU64::new(0),
        }
    }

    /// Publish a triggered alert level
    pub fn publish_triggered(&self, triggered: TriggeredAlert) {
        let _ = self.triggered_tx.send(triggered.clone());
        self.publish_event(EventPayload::Triggered(triggered));
    }

    /// Publish a sensor state change
    pub fn publish_state_change(&self, state_change: StateChange) {
        self.publish_event(EventPayload::StateChange(state_change));
    }

    /// Publish a full status update
    pub fn publish_status(&self, profile: Option<u32>, sensors: Vec<Sensor>) {
        self.publish_event(EventPayload::Status { profile, sensors });
    }

    /// Publish a profile switch
    pub fn publish_profile_changed(&self, profile: u32, name: &str) {
        self.publish_event(EventPayload::Profile {
            profile,
            name: name.to_string(),
        });
    }

    /// Publish an error report
    pub fn publish_error(&self, code: u32, message: &str) {
        self.publish_event(EventPayload::Error {
            code,
            message: message.to_string(),
        });
    }

    fn publish_event(&self, payload: EventPayload) {
        let id = self.event_counter.fetch_add(1, Ordering::Relaxed);
        let event = Event {
            id,
            event_type: payload.event_type(),
            timestamp: Utc::now(),
            payload,
        };
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Receive triggered alert levels only
    pub fn subscribe_triggered(&self) -> broadcast::Receiver<TriggeredAlert> {
        self.triggered_tx.subscribe()
    }

    /// Receive every event
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Events published so far
    pub fn events_published(&self) -> u64 {
        self.event_counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::sensor_alert::tests::sample_sensor_alert;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(16);
        bus.publish_error(1, "nobody listens");
        assert_eq!(bus.events_published(), 1);
    }

    #[tokio::test]
    async fn test_triggered_reaches_both_channels() {
        let bus = EventBus::new(16);
        let mut triggered_rx = bus.subscribe_triggered();
        let mut event_rx = bus.subscribe_events();

        bus.publish_triggered(TriggeredAlert {
            alert_level: 3,
            alert_level_name: "Siren".to_string(),
            sensor_alert: sample_sensor_alert(),
        });

        let triggered = triggered_rx.recv().await.unwrap();
        assert_eq!(triggered.alert_level, 3);

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::SensorAlertTriggered);
        assert_eq!(event.id, 0);
    }
}
