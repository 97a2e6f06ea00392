// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Sensor alert executer
//!
//! Single-owner loop that turns persisted sensor alerts into alert level
//! dispatches. Each pass:
//!
//! 1. reads the active profile and loads all pending sensor alerts
//! 2. splits off instrumented alert levels into their own states
//! 3. narrows the suitable alert levels of every state
//! 4. starts instrumentations that are due
//! 5. removes states that can no longer trigger anything
//! 6. triggers events whose delay passed and whose instrumentation finished
//! 7. removes finished events from storage and queues manager updates

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use super::dispatch::AlertDispatcher;
use super::instrumentation::InstrumentationRunner;
use super::level::AlertLevel;
use super::promise::InstrumentationPromise;
use super::sensor_alert::{SensorAlert, SensorData, SensorState};
use super::state::{EvaluationSnapshot, SensorAlertState};
use crate::config::Config;
use crate::manager::StateChangeQueue;
use crate::storage::{self, Storage};

/// Raw event submitted by a producer
#[derive(Debug, Clone)]
pub struct NewSensorAlert {
    /// Node reporting the event
    pub node_id: i64,
    /// Sensor reporting the event
    pub sensor_id: i64,
    /// Reported state
    pub state: SensorState,
    /// Optional payload, must be a JSON object
    pub optional_data: Option<Value>,
    /// Does the event change the persisted sensor state?
    pub change_state: bool,
    /// Does the event carry the latest sensor data?
    pub has_latest_data: bool,

    /// Data reported with the event; the persisted sensor data is used when
    /// `None`
    pub data: Option<SensorData>,
}

/// Producer side of the executer: persists events and wakes the loop
#[derive(Clone)]
pub struct ExecuterHandle {
    storage: Arc<dyn Storage>,
    wake: Arc<Notify>,
}

impl ExecuterHandle {
    /// Handle persisting into `storage` and waking through `wake`
    pub fn new(storage: Arc<dyn Storage>, wake: Arc<Notify>) -> Self {
        Self { storage, wake }
    }

    /// Persist a sensor alert for the given sensor and wake the executer
    pub fn add_sensor_alert(&self, new: NewSensorAlert) -> Result<i64> {
        let sensor = self
            .storage
            .get_sensor(new.sensor_id)?
            .ok_or_else(|| anyhow!("unknown sensor {}", new.sensor_id))?;

        if sensor.node_id != new.node_id {
            return Err(anyhow!(
                "sensor {} does not belong to node {}",
                new.sensor_id,
                new.node_id
            ));
        }

        let data = new.data.unwrap_or_else(|| sensor.data.clone());

        let sensor_alert = SensorAlert {
            sensor_alert_id: 0,
            node_id: new.node_id,
            sensor_id: new.sensor_id,
            description: sensor.description,
            time_received: Utc::now().timestamp(),
            alert_delay: sensor.alert_delay,
            state: new.state,
            has_optional_data: new.optional_data.is_some(),
            optional_data: new.optional_data,
            change_state: new.change_state,
            alert_levels: sensor.alert_levels,
            triggered_alert_levels: Vec::new(),
            has_latest_data: new.has_latest_data,
            data_type: sensor.data_type,
            data,
        };
        sensor_alert.validate()?;

        let id = self.storage.add_sensor_alert(&sensor_alert)?;
        debug!(sensor_alert_id = id, sensor_id = new.sensor_id, "Sensor alert added");

        self.wake();
        Ok(id)
    }

    /// Set the wake signal so pending states are evaluated right away
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Outcome counters of one executer pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Pass skipped because the active profile was unavailable
    pub skipped: bool,
    /// Sensor alerts loaded
    pub new_states: usize,
    /// Instrumentations started
    pub instrumentations_started: usize,
    /// Alert level dispatches
    pub triggered: usize,
    /// States removed without triggering
    pub dropped: usize,
    /// Sensor alerts removed from storage
    pub finalized: usize,
    /// Manager updates queued
    pub manager_updates: usize,
}

impl PassReport {
    /// Did the pass change anything?
    pub fn has_activity(&self) -> bool {
        self.new_states > 0 || self.instrumentations_started > 0 || self.triggered > 0 || self.dropped > 0
            || self.finalized > 0
    }
}

/// Counters shared with the engine
#[derive(Debug, Default)]
pub struct ExecuterStats {
    passes: AtomicU64,
    total_triggered: AtomicU64,
    total_dropped: AtomicU64,
    total_manager_updates: AtomicU64,
    pending_states: AtomicUsize,
    last_trigger: Mutex<Option<DateTime<Utc>>>,
}

impl ExecuterStats {
    /// Passes run so far
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Alert level dispatches so far
    pub fn total_triggered(&self) -> u64 {
        self.total_triggered.load(Ordering::Relaxed)
    }

    /// States dropped so far
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }

    /// Manager updates queued so far
    pub fn total_manager_updates(&self) -> u64 {
        self.total_manager_updates.load(Ordering::Relaxed)
    }

    /// States pending after the last pass
    pub fn pending_states(&self) -> usize {
        self.pending_states.load(Ordering::Relaxed)
    }

    /// Time of the last dispatch
    pub fn last_trigger(&self) -> Option<DateTime<Utc>> {
        *self.last_trigger.lock()
    }

    fn record(&self, report: &PassReport, pending: usize, now: i64) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.total_triggered
            .fetch_add(report.triggered as u64, Ordering::Relaxed);
        self.total_dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.total_manager_updates
            .fetch_add(report.manager_updates as u64, Ordering::Relaxed);
        self.pending_states.store(pending, Ordering::Relaxed);
        if report.triggered > 0 {
            *self.last_trigger.lock() = Utc.timestamp_opt(now, 0).single();
        }
    }
}

/// Bookkeeping per originating sensor alert id
struct EventTracking {
    any_triggered: bool,
}

/// Decides which alert levels persisted sensor alerts trigger
pub struct SensorAlertExecuter {
    storage: Arc<dyn Storage>,
    alert_levels: Arc<BTreeMap<u32, AlertLevel>>,
    profiles: HashSet<u32>,
    dispatcher: Arc<dyn AlertDispatcher>,
    manager: Arc<dyn StateChangeQueue>,
    runner: InstrumentationRunner,
    wake: Arc<Notify>,
    poll_interval: Duration,
    idle_wait: Duration,

    states: Vec<SensorAlertState>,
    events: HashMap<i64, EventTracking>,

    /// Finalized events whose row could not be removed yet
    unremoved: HashSet<i64>,

    stats: Arc<ExecuterStats>,
}

impl SensorAlertExecuter {
    /// Build an executer for the configured alert levels and profiles
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        dispatcher: Arc<dyn AlertDispatcher>,
        manager: Arc<dyn StateChangeQueue>,
        runner: InstrumentationRunner,
    ) -> Self {
        let alert_levels = config
            .alert_levels
            .iter()
            .map(|l| (l.level, l.clone()))
            .collect::<BTreeMap<_, _>>();

        Self {
            storage,
            alert_levels: Arc::new(alert_levels),
            profiles: config.profiles.iter().map(|p| p.id).collect(),
            dispatcher,
            manager,
            runner,
            wake: Arc::new(Notify::new()),
            poll_interval: config.engine.poll_interval(),
            idle_wait: config.engine.idle_wait(),
            states: Vec::new(),
            events: HashMap::new(),
            unremoved: HashSet::new(),
            stats: Arc::new(ExecuterStats::default()),
        }
    }

    /// Share the wake signal with handles created elsewhere
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Producer handle sharing this executer's wake signal
    pub fn handle(&self) -> ExecuterHandle {
        ExecuterHandle::new(self.storage.clone(), self.wake.clone())
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<ExecuterStats> {
        self.stats.clone()
    }

    /// States still pending
    pub fn states(&self) -> &[SensorAlertState] {
        &self.states
    }

    /// Promises of all instrumentations attached to current states
    pub fn instrumentation_promises(&self) -> Vec<InstrumentationPromise> {
        self.states
            .iter()
            .filter_map(|s| s.instrumentation_promise().cloned())
            .collect()
    }

    /// Run one evaluation pass at UTC second `now`
    pub fn run_pass(&mut self, now: i64) -> PassReport {
        let mut report = PassReport::default();

        let profile = match storage::active_profile(self.storage.as_ref()) {
            Ok(profile) => profile,
            Err(e) => {
                error!("Unable to read active profile, skipping pass: {}", e);
                report.skipped = true;
                return report;
            }
        };
        if !self.profiles.contains(&profile) {
            warn!(profile, "Active profile is not configured");
        }
        let snapshot = EvaluationSnapshot::new(profile, self.alert_levels.clone());

        report.new_states = self.load_new_sensor_alerts(&snapshot);
        self.separate_instrumentation_alert_levels(&snapshot);
        self.update_suitable_alert_levels(&snapshot);
        report.instrumentations_started = self.update_instrumentation(&snapshot);
        let (dropped, manager_updates) = self.filter_sensor_alerts();
        report.dropped = dropped;
        report.manager_updates = manager_updates;
        report.triggered = self.process_sensor_alerts(now);
        report.finalized = self.finalize_events();

        self.stats.record(&report, self.states.len(), now);
        report
    }

    fn load_new_sensor_alerts(&mut self, snapshot: &EvaluationSnapshot) -> usize {
        let pending = match self.storage.get_pending_sensor_alerts() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Unable to load pending sensor alerts: {}", e);
                return 0;
            }
        };

        let pending_ids: HashSet<i64> = pending.iter().map(|a| a.sensor_alert_id).collect();
        self.unremoved.retain(|id| pending_ids.contains(id));

        let mut added = 0;
        for sensor_alert in pending {
            let id = sensor_alert.sensor_alert_id;
            if self.events.contains_key(&id) {
                continue;
            }
            if self.unremoved.contains(&id) {
                self.remove_sensor_alert(id);
                continue;
            }

            if let Err(e) = sensor_alert.validate() {
                warn!(sensor_alert_id = id, "Discarding invalid sensor alert: {}", e);
                self.remove_sensor_alert(id);
                continue;
            }

            debug!(
                sensor_alert_id = id,
                sensor_id = sensor_alert.sensor_id,
                "New sensor alert '{}'",
                sensor_alert.description
            );

            self.events.insert(
                id,
                EventTracking {
                    any_triggered: false,
                },
            );
            self.states.push(SensorAlertState::new(sensor_alert, snapshot));
            added += 1;
        }

        added
    }

    /// Give every instrumented alert level its own state
    pub fn separate_instrumentation_alert_levels(&mut self, snapshot: &EvaluationSnapshot) {
        let states = std::mem::take(&mut self.states);
        self.states = states
            .into_iter()
            .flat_map(|s| s.split_instrumented(snapshot))
            .collect();
    }

    /// Narrow the suitable alert levels of every state
    pub fn update_suitable_alert_levels(&mut self, snapshot: &EvaluationSnapshot) {
        for state in self.states.iter_mut() {
            state.update_suitable_alert_levels(snapshot);
        }
    }

    /// Start instrumentations for states waiting on one; returns how many
    pub fn update_instrumentation(&mut self, snapshot: &EvaluationSnapshot) -> usize {
        let mut started = 0;

        for state in self.states.iter_mut().filter(|s| s.needs_instrumentation()) {
            let level = state.suitable_alert_levels()[0];
            let Some(alert_level) = snapshot.alert_level(level) else {
                continue;
            };

            match state.start_instrumentation(alert_level, &self.runner) {
                Ok(_) => {
                    debug!(
                        sensor_alert_id = state.sensor_alert_id(),
                        alert_level = level,
                        "Instrumentation started"
                    );
                    started += 1;
                }
                Err(e) => error!(sensor_alert_id = state.sensor_alert_id(), "{}", e),
            }
        }

        started
    }

    /// Remove states without suitable alert levels. Every removed state
    /// that reports a state or data change queues one manager update.
    /// Returns the number of removed states and of queued updates.
    pub fn filter_sensor_alerts(&mut self) -> (usize, usize) {
        let (dropped, kept): (Vec<SensorAlertState>, Vec<SensorAlertState>) =
            std::mem::take(&mut self.states)
                .into_iter()
                .partition(SensorAlertState::is_dropped);
        self.states = kept;

        let mut manager_updates = 0;
        for state in &dropped {
            let sensor_alert = state.init_sensor_alert();
            debug!(
                sensor_alert_id = state.sensor_alert_id(),
                "Sensor alert '{}' does not satisfy any trigger condition",
                sensor_alert.description
            );
            if sensor_alert.reports_change() && self.queue_manager_update(sensor_alert.sensor_id) {
                manager_updates += 1;
            }
        }

        (dropped.len(), manager_updates)
    }

    /// Trigger every event whose states are all ready; returns the number of
    /// alert level dispatches
    pub fn process_sensor_alerts(&mut self, now: i64) -> usize {
        let mut waiting: HashSet<i64> = HashSet::new();
        for state in &self.states {
            if !state.is_ready(now) {
                waiting.insert(state.sensor_alert_id());
            }
        }

        let mut triggered = 0;
        let mut remaining = Vec::with_capacity(self.states.len());

        for state in std::mem::take(&mut self.states) {
            if waiting.contains(&state.sensor_alert_id()) {
                remaining.push(state);
                continue;
            }

            let sensor_alert = state.sensor_alert();
            for level in state.suitable_alert_levels() {
                let Some(alert_level) = self.alert_levels.get(level) else {
                    continue;
                };
                self.dispatcher.trigger(alert_level, sensor_alert);
                triggered += 1;
            }

            if let Some(event) = self.events.get_mut(&state.sensor_alert_id()) {
                event.any_triggered = true;
            }
        }

        self.states = remaining;
        triggered
    }

    /// Remove events without states from storage; returns how many
    fn finalize_events(&mut self) -> usize {
        let active: HashSet<i64> = self.states.iter().map(SensorAlertState::sensor_alert_id).collect();
        let finished: Vec<i64> = self
            .events
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();

        for id in &finished {
            let Some(event) = self.events.remove(id) else {
                continue;
            };
            if !event.any_triggered {
                debug!(sensor_alert_id = *id, "Sensor alert dropped");
            }
            self.remove_sensor_alert(*id);
        }

        finished.len()
    }

    /// Queue the persisted state and data of a sensor for manager clients
    pub fn queue_manager_update(&self, sensor_id: i64) -> bool {
        let data = match self.storage.get_sensor_data(sensor_id) {
            Ok(data) => data,
            Err(e) => {
                error!(sensor_id, "Unable to get sensor data, skipping state change: {}", e);
                return false;
            }
        };
        let state = match self.storage.get_sensor_state(sensor_id) {
            Ok(state) => state,
            Err(e) => {
                error!(sensor_id, "Unable to get sensor state, skipping state change: {}", e);
                return false;
            }
        };

        self.manager.queue_state_change(sensor_id, state, data);
        true
    }

    fn remove_sensor_alert(&mut self, id: i64) {
        match self.storage.remove_sensor_alert(id) {
            Ok(()) => {
                self.unremoved.remove(&id);
            }
            Err(e) => {
                warn!(sensor_alert_id = id, "Unable to remove sensor alert: {}", e);
                self.unremoved.insert(id);
            }
        }
    }

    /// Evaluate until shutdown. Runs on `poll_interval` while states are
    /// pending and waits up to `idle_wait` for the wake signal otherwise.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            alert_levels = self.alert_levels.len(),
            "Sensor alert executer started"
        );

        loop {
            let report = self.run_pass(Utc::now().timestamp());
            if report.has_activity() {
                debug!(?report, pending = self.states.len(), "Executer pass");
            }

            let wait = if self.states.is_empty() {
                self.idle_wait
            } else {
                self.poll_interval
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.runner.close();
        info!(pending = self.states.len(), "Sensor alert executer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::dispatch::tests::RecordingDispatcher;
    use crate::alert::instrumentation::tests::{instrumented_level, write_script};
    use crate::alert::level::Profile;
    use crate::alert::sensor_alert::tests::sample_sensor_alert;
    use crate::manager::tests::RecordingQueue;
    use crate::storage::tests::sample_sensor;
    use crate::storage::{SqliteStorage, PROFILE_OPTION};

    struct Fixture {
        storage: Arc<SqliteStorage>,
        dispatcher: Arc<RecordingDispatcher>,
        queue: Arc<RecordingQueue>,
        executer: SensorAlertExecuter,
    }

    fn fixture(alert_levels: Vec<AlertLevel>) -> Fixture {
        let mut config = Config::default();
        config.profiles = vec![
            Profile {
                id: 0,
                name: "Home".to_string(),
            },
            Profile {
                id: 1,
                name: "Away".to_string(),
            },
        ];
        config.alert_levels = alert_levels;

        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        storage.update_option(PROFILE_OPTION, "0").unwrap();
        storage.upsert_sensor(&sample_sensor(3, vec![1])).unwrap();

        let dispatcher = Arc::new(RecordingDispatcher::default());
        let queue = Arc::new(RecordingQueue::default());
        let executer = SensorAlertExecuter::new(
            &config,
            storage.clone(),
            dispatcher.clone(),
            queue.clone(),
            InstrumentationRunner::new(4),
        );

        Fixture {
            storage,
            dispatcher,
            queue,
            executer,
        }
    }

    fn store(storage: &SqliteStorage, alert_levels: Vec<u32>) -> i64 {
        let mut alert = sample_sensor_alert();
        alert.sensor_id = 3;
        alert.alert_levels = alert_levels;
        storage.add_sensor_alert(&alert).unwrap()
    }

    async fn run_until_idle(executer: &mut SensorAlertExecuter, now: i64) -> PassReport {
        let mut total = PassReport::default();
        for _ in 0..200 {
            let report = executer.run_pass(now);
            total.triggered += report.triggered;
            total.dropped += report.dropped;
            total.finalized += report.finalized;
            total.manager_updates += report.manager_updates;
            if executer.states().is_empty() {
                return total;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("executer did not become idle");
    }

    #[test]
    fn test_triggers_and_removes_row() {
        let mut f = fixture(vec![AlertLevel::new(1, "One"), AlertLevel::new(2, "Two")]);
        store(&f.storage, vec![1, 2]);

        let report = f.executer.run_pass(2000);

        assert_eq!(report.new_states, 1);
        assert_eq!(report.triggered, 2);
        assert_eq!(report.finalized, 1);
        assert_eq!(f.dispatcher.levels(), vec![1, 2]);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());

        let report = f.executer.run_pass(2001);
        assert_eq!(report, PassReport::default());
        assert_eq!(f.dispatcher.count(), 2);
    }

    #[test]
    fn test_unarmed_profile_drops_with_manager_update() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        f.storage.update_option(PROFILE_OPTION, "1").unwrap();
        store(&f.storage, vec![1]);

        let report = f.executer.run_pass(2000);

        assert_eq!(report.triggered, 0);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.manager_updates, 1);
        assert_eq!(f.queue.count(), 1);
        assert_eq!(f.queue.changes.lock()[0].sensor_id, 3);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[test]
    fn test_drop_without_change_skips_manager_update() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        f.storage.update_option(PROFILE_OPTION, "1").unwrap();

        let mut alert = sample_sensor_alert();
        alert.sensor_id = 3;
        alert.change_state = false;
        alert.has_latest_data = false;
        f.storage.add_sensor_alert(&alert).unwrap();

        let report = f.executer.run_pass(2000);
        assert_eq!(report.dropped, 1);
        assert_eq!(f.queue.count(), 0);
    }

    #[test]
    fn test_manager_update_skips_unknown_sensor() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        f.storage.update_option(PROFILE_OPTION, "1").unwrap();

        let mut alert = sample_sensor_alert();
        alert.sensor_id = 99;
        f.storage.add_sensor_alert(&alert).unwrap();

        let report = f.executer.run_pass(2000);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.manager_updates, 0);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[test]
    fn test_missing_profile_skips_pass() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        f.executer.storage = storage.clone();
        store(&storage, vec![1]);

        let report = f.executer.run_pass(2000);
        assert!(report.skipped);
        assert_eq!(storage.get_pending_sensor_alerts().unwrap().len(), 1);

        storage.update_option(PROFILE_OPTION, "0").unwrap();
        let report = f.executer.run_pass(2000);
        assert_eq!(report.triggered, 1);
    }

    #[test]
    fn test_alert_delay_and_profile_switch() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        let mut alert = sample_sensor_alert();
        alert.sensor_id = 3;
        alert.time_received = 1000;
        alert.alert_delay = 5;
        f.storage.add_sensor_alert(&alert).unwrap();

        for now in 1000..1003 {
            assert_eq!(f.executer.run_pass(now).triggered, 0);
        }
        f.storage.update_option(PROFILE_OPTION, "1").unwrap();
        f.executer.run_pass(1003);
        f.storage.update_option(PROFILE_OPTION, "0").unwrap();
        let report = f.executer.run_pass(1005);

        assert_eq!(report.triggered, 0);
        assert_eq!(f.dispatcher.count(), 0);
        assert_eq!(f.queue.count(), 1);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_alert_level_dropped() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        store(&f.storage, vec![1, 42]);

        let report = f.executer.run_pass(2000);
        assert_eq!(report.triggered, 1);
        assert_eq!(f.dispatcher.levels(), vec![1]);
    }

    #[test]
    fn test_handle_adds_sensor_alert() {
        let f = fixture(vec![AlertLevel::new(1, "One")]);
        let handle = f.executer.handle();

        let id = handle
            .add_sensor_alert(NewSensorAlert {
                node_id: 2,
                sensor_id: 3,
                state: SensorState::Triggered,
                optional_data: Some(serde_json::json!({"message": "test"})),
                change_state: true,
                has_latest_data: false,
                data: None,
            })
            .unwrap();

        let pending = f.storage.get_pending_sensor_alerts().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sensor_alert_id, id);
        assert_eq!(pending[0].description, "Sensor 3");
        assert_eq!(pending[0].alert_levels, vec![1]);
        assert!(pending[0].has_optional_data);

        let unknown = handle.add_sensor_alert(NewSensorAlert {
            node_id: 2,
            sensor_id: 99,
            state: SensorState::Triggered,
            optional_data: None,
            change_state: false,
            has_latest_data: false,
            data: None,
        });
        assert!(unknown.is_err());
        assert_eq!(f.storage.get_pending_sensor_alerts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instrumented_level_runs_separately() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "mirror.sh", "cat");
        let mut f = fixture(vec![instrumented_level(1, &script, 10), AlertLevel::new(2, "Plain")]);
        store(&f.storage, vec![1, 2]);

        let first = f.executer.run_pass(2000);
        assert_eq!(first.instrumentations_started, 1);
        assert_eq!(first.triggered, 0);
        assert_eq!(f.executer.states().len(), 2);
        assert_eq!(f.executer.instrumentation_promises().len(), 1);

        let total = run_until_idle(&mut f.executer, 2000).await;
        assert_eq!(total.triggered, 2);
        assert_eq!(f.dispatcher.levels(), vec![1, 2]);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_instrumentation_never_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "cat > /dev/null\nexit 1");
        let mut f = fixture(vec![instrumented_level(1, &script, 10)]);
        store(&f.storage, vec![1]);

        let total = run_until_idle(&mut f.executer, 2000).await;

        assert_eq!(total.triggered, 0);
        assert_eq!(total.dropped, 1);
        assert_eq!(f.queue.count(), 1);
    }

    #[tokio::test]
    async fn test_each_suppressed_state_queues_manager_update() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "suppress.sh", "cat > /dev/null\necho '{}'");
        let mut f = fixture(vec![
            instrumented_level(1, &script, 10),
            instrumented_level(2, &script, 10),
            AlertLevel::new(3, "Plain"),
        ]);
        store(&f.storage, vec![1, 2, 3]);

        let total = run_until_idle(&mut f.executer, 2000).await;

        assert_eq!(f.dispatcher.levels(), vec![3]);
        assert_eq!(total.dropped, 2);
        assert_eq!(total.manager_updates, 2);
        assert_eq!(f.queue.count(), 2);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_switch_during_instrumentation_never_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow_mirror.sh", "sleep 1\ncat");
        let mut f = fixture(vec![instrumented_level(1, &script, 10)]);
        store(&f.storage, vec![1]);

        let first = f.executer.run_pass(2000);
        assert_eq!(first.instrumentations_started, 1);

        f.storage.update_option(PROFILE_OPTION, "1").unwrap();
        let promises = f.executer.instrumentation_promises();
        let total = run_until_idle(&mut f.executer, 2000).await;

        assert_eq!(total.triggered, 0);
        assert_eq!(f.dispatcher.count(), 0);
        assert_eq!(f.queue.count(), 1);

        // The instrumentation still runs to completion, its result is discarded
        tokio::time::timeout(Duration::from_secs(20), promises[0].finished())
            .await
            .unwrap();
        f.storage.update_option(PROFILE_OPTION, "0").unwrap();
        assert_eq!(f.executer.run_pass(2001).triggered, 0);
        assert_eq!(f.dispatcher.count(), 0);
    }

    #[test]
    fn test_huge_alert_delay_keeps_pass_running() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        let mut alert = sample_sensor_alert();
        alert.sensor_id = 3;
        alert.time_received = 1000;
        alert.alert_delay = i64::MAX;
        f.storage.add_sensor_alert(&alert).unwrap();
        store(&f.storage, vec![1]);

        let report = f.executer.run_pass(2000);

        assert_eq!(report.triggered, 1);
        assert_eq!(f.executer.states().len(), 1);
        assert_eq!(f.storage.get_pending_sensor_alerts().unwrap().len(), 1);
    }

    #[test]
    fn test_negative_alert_delay_discarded() {
        let mut f = fixture(vec![AlertLevel::new(1, "One")]);
        let mut alert = sample_sensor_alert();
        alert.sensor_id = 3;
        alert.alert_delay = -5;
        f.storage.add_sensor_alert(&alert).unwrap();

        let report = f.executer.run_pass(2000);

        assert_eq!(report.new_states, 0);
        assert_eq!(report.triggered, 0);
        assert!(f.storage.get_pending_sensor_alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_wakes_and_stops() {
        let f = fixture(vec![AlertLevel::new(1, "One")]);
        let handle = f.executer.handle();
        let stats = f.executer.stats();
        let dispatcher = f.dispatcher.clone();
        let mut executer = f.executer;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(async move { executer.run(shutdown_rx).await });

        handle
            .add_sensor_alert(NewSensorAlert {
                node_id: 2,
                sensor_id: 3,
                state: SensorState::Triggered,
                optional_data: None,
                change_state: true,
                has_latest_data: false,
                data: None,
            })
            .unwrap();

        for _ in 0..100 {
            if dispatcher.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dispatcher.count(), 1);
        assert_eq!(stats.total_triggered(), 1);
        assert!(stats.last_trigger().is_some());

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
    }
}
