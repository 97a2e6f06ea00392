// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Status updates for manager clients
//!
//! State changes are queued without blocking and published by a separate
//! worker. A periodic full status update replaces whatever is still queued.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::alert::{SensorData, SensorDataType, SensorState};
use crate::core::EventBus;
use crate::storage::{self, Storage};

/// Persisted state and data of one sensor, pushed to manager clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Server-wide sensor id
    pub sensor_id: i64,
    /// Persisted state
    pub state: SensorState,
    /// Type tag of `data`
    pub data_type: SensorDataType,
    /// Persisted data
    pub data: SensorData,
}

/// Non-blocking sink for state change notifications
pub trait StateChangeQueue: Send + Sync {
    /// Queue a state change; never blocks
    fn queue_state_change(&self, sensor_id: i64, state: SensorState, data: SensorData);
}

/// Counters of the manager update executer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStats {
    /// State changes published
    pub state_changes_sent: u64,
    /// Full status updates published
    pub status_updates_sent: u64,
    /// Queued state changes replaced by a full status update
    pub state_changes_superseded: u64,
}

/// Worker publishing queued state changes and periodic full status updates
pub struct ManagerUpdateExecuter {
    storage: Arc<dyn Storage>,
    bus: Arc<EventBus>,
    update_interval: Duration,
    queue: Mutex<VecDeque<StateChange>>,
    wake: Notify,
    force_update: AtomicBool,
    state_changes_sent: AtomicU64,
    status_updates_sent: AtomicU64,
    state_changes_superseded: AtomicU64,
}

impl ManagerUpdateExecuter {
    /// Create a new instance
    pub fn new(storage: Arc<dyn Storage>, bus: Arc<EventBus>, update_interval: Duration) -> Self {
        Self {
            storage,
            bus,
            update_interval,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            force_update: AtomicBool::new(false),
            state_changes_sent: AtomicU64::new(0),
            status_updates_sent: AtomicU64::new(0),
            state_changes_superseded: AtomicU64::new(0),
        }
    }

    /// Request a full status update on the next wake
    pub fn force_status_update(&self) {
        self.force_update.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// State changes waiting to be published
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            state_changes_sent: self.state_changes_sent.load(Ordering::Relaxed),
            status_updates_sent: self.status_updates_sent.load(Ordering::Relaxed),
            state_changes_superseded: self.state_changes_superseded.load(Ordering::Relaxed),
        }
    }

    /// Publish every queued state change; returns how many were sent
    pub fn process_queue(&self) -> usize {
        let drained: Vec<StateChange> = self.queue.lock().drain(..).collect();
        let count = drained.len();

        for state_change in drained {
            debug!(sensor_id = state_change.sensor_id, "Sending state change");
            self.bus.publish_state_change(state_change);
        }

        self.state_changes_sent.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Publish the persisted state of all sensors and discard queued changes
    pub fn send_status_update(&self) -> Result<usize> {
        let sensors = self.storage.get_sensors()?;
        let profile = match storage::active_profile(self.storage.as_ref()) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Status update without active profile: {}", e);
                None
            }
        };

        let superseded = {
            let mut queue = self.queue.lock();
            let len = queue.len();
            queue.clear();
            len
        };
        if superseded > 0 {
            debug!(superseded, "Full status update supersedes queued state changes");
        }

        let count = sensors.len();
        self.bus.publish_status(profile, sensors);

        self.status_updates_sent.fetch_add(1, Ordering::Relaxed);
        self.state_changes_superseded
            .fetch_add(superseded as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn status_update(&self) {
        if let Err(e) = self.send_status_update() {
            warn!("Status update failed: {}", e);
        }
    }

    /// Run until shutdown. The first status update goes out immediately.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.update_interval.as_secs(),
            "Manager update executer started"
        );

        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.force_update.store(false, Ordering::SeqCst);
                    self.status_update();
                }
                _ = self.wake.notified() => {
                    if self.force_update.swap(false, Ordering::SeqCst) {
                        self.status_update();
                        ticker.reset();
                    } else {
                        self.process_queue();
                    }
                }
            }
        }

        info!("Manager update executer stopped");
    }
}

impl StateChangeQueue for ManagerUpdateExecuter {
    fn queue_state_change(&self, sensor_id: i64, state: SensorState, data: SensorData) {
        self.queue.lock().push_back(StateChange {
            sensor_id,
            state,
            data_type: data.data_type(),
            data,
        });
        self.wake.notify_one();
    }
}
