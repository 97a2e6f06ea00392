// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Per-event working state of the sensor alert executer

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::instrumentation::{Instrumentation, InstrumentationRunner};
use super::level::AlertLevel;
use super::promise::{InstrumentationPromise, PromiseState};
use super::sensor_alert::SensorAlert;

/// Misuse of a state's instrumentation bookkeeping
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// The state already has an instrumentation
    #[error("instrumentation already attached to sensor alert {0}")]
    AlreadyAttached(i64),

    /// The state or alert level has no instrumentation
    #[error("sensor alert {0} does not use instrumentation")]
    NotInstrumented(i64),

    /// Instrumentation needs exactly one suitable alert level
    #[error("sensor alert {sensor_alert_id} has {count} suitable alert levels, instrumentation needs exactly one")]
    AmbiguousAlertLevel {
        /// Originating sensor alert
        sensor_alert_id: i64,
        /// Number of suitable alert levels
        count: usize,
    },
}

/// Read-only configuration fetched at the start of each pass
#[derive(Debug, Clone)]
pub struct EvaluationSnapshot {
    /// Profile active during this pass
    pub active_profile: u32,
    /// Configured alert levels by id
    pub alert_levels: Arc<BTreeMap<u32, AlertLevel>>,
}

impl EvaluationSnapshot {
    /// Create a new instance
    pub fn new(active_profile: u32, alert_levels: Arc<BTreeMap<u32, AlertLevel>>) -> Self {
        Self {
            active_profile,
            alert_levels,
        }
    }

    /// Configured alert level by id
    pub fn alert_level(&self, level: u32) -> Option<&AlertLevel> {
        self.alert_levels.get(&level)
    }
}

/// Wraps one sensor alert while the executer decides what to do with it.
///
/// `init` is the event as loaded from storage and is never touched again.
/// `current` starts as a copy of it and is replaced by the event an
/// instrumentation returned, which then governs the trigger-direction checks.
pub struct SensorAlertState {
    init: SensorAlert,
    current: SensorAlert,

    /// Candidate alert levels at construction
    alert_levels: Vec<u32>,

    /// Narrowing subset of `alert_levels` that currently qualifies
    suitable_alert_levels: Vec<u32>,

    uses_instrumentation: bool,
    instrumentation: Option<Instrumentation>,
    promise: Option<InstrumentationPromise>,
    instrumentation_processed: bool,
}

impl SensorAlertState {
    /// Wrap a loaded sensor alert. Alert level ids without configuration are
    /// dropped here.
    pub fn new(sensor_alert: SensorAlert, snapshot: &EvaluationSnapshot) -> Self {
        let mut alert_levels = Vec::with_capacity(sensor_alert.alert_levels.len());
        for &level in &sensor_alert.alert_levels {
            if snapshot.alert_level(level).is_none() {
                warn!(
                    sensor_alert_id = sensor_alert.sensor_alert_id,
                    alert_level = level,
                    "Sensor alert references unknown alert level"
                );
                continue;
            }
            if !alert_levels.contains(&level) {
                alert_levels.push(level);
            }
        }

        let uses_instrumentation = alert_levels.len() == 1
            && snapshot
                .alert_level(alert_levels[0])
                .map(AlertLevel::instrumentation_active)
                .unwrap_or(false);

        Self {
            current: sensor_alert.clone(),
            init: sensor_alert,
            suitable_alert_levels: alert_levels.clone(),
            alert_levels,
            uses_instrumentation,
            instrumentation: None,
            promise: None,
            instrumentation_processed: !uses_instrumentation,
        }
    }

    /// Independent state for one instrumented alert level
    fn derive_for_level(&self, level: u32) -> Self {
        let mut current = self.init.clone();
        current.triggered_alert_levels = vec![level];

        Self {
            init: self.init.clone(),
            current,
            alert_levels: vec![level],
            suitable_alert_levels: vec![level],
            uses_instrumentation: true,
            instrumentation: None,
            promise: None,
            instrumentation_processed: false,
        }
    }

    /// Partition into one state per instrumented alert level plus one state
    /// for all remaining alert levels. States already mid-instrumentation and
    /// states with at most one suitable level are returned as they are.
    pub fn split_instrumented(mut self, snapshot: &EvaluationSnapshot) -> Vec<SensorAlertState> {
        if self.instrumentation.is_some() || self.promise.is_some() {
            return vec![self];
        }

        let is_instrumented = |level: &u32| {
            snapshot
                .alert_level(*level)
                .map(AlertLevel::instrumentation_active)
                .unwrap_or(false)
        };

        if self.suitable_alert_levels.len() <= 1 {
            if !self.uses_instrumentation && self.suitable_alert_levels.iter().any(is_instrumented) {
                self.uses_instrumentation = true;
                self.instrumentation_processed = false;
            }
            return vec![self];
        }

        let (instrumented, plain): (Vec<u32>, Vec<u32>) =
            self.suitable_alert_levels.iter().partition(|l| is_instrumented(l));
        if instrumented.is_empty() {
            return vec![self];
        }

        debug!(
            sensor_alert_id = self.init.sensor_alert_id,
            instrumented = instrumented.len(),
            plain = plain.len(),
            "Separating instrumented alert levels"
        );

        let mut states: Vec<SensorAlertState> =
            instrumented.iter().map(|&level| self.derive_for_level(level)).collect();

        if !plain.is_empty() {
            self.alert_levels.retain(|l| plain.contains(l));
            self.suitable_alert_levels = plain;
            self.uses_instrumentation = false;
            self.instrumentation_processed = true;
            states.push(self);
        }

        states
    }

    /// Narrow the suitable alert levels under the given snapshot.
    ///
    /// Levels only ever leave the set. A pending instrumented level is kept
    /// until its promise resolves; failure or suppression drops it.
    pub fn update_suitable_alert_levels(&mut self, snapshot: &EvaluationSnapshot) {
        self.collect_instrumentation_result(snapshot);

        let sensor_alert_id = self.init.sensor_alert_id;
        let awaiting = self.uses_instrumentation && !self.instrumentation_processed;
        let state = self.current.state;

        self.suitable_alert_levels.retain(|&level| {
            let Some(alert_level) = snapshot.alert_level(level) else {
                warn!(sensor_alert_id, alert_level = level, "Alert level no longer configured");
                return false;
            };

            if !alert_level.is_armed(snapshot.active_profile) {
                debug!(
                    sensor_alert_id,
                    alert_level = level,
                    profile = snapshot.active_profile,
                    "Alert level not armed under active profile"
                );
                return false;
            }

            if awaiting && alert_level.instrumentation_active() {
                return true;
            }

            alert_level.reacts_to(state)
        });

        self.current.triggered_alert_levels = self.suitable_alert_levels.clone();
    }

    fn collect_instrumentation_result(&mut self, snapshot: &EvaluationSnapshot) {
        if self.instrumentation_processed {
            return;
        }
        let Some(promise) = self.promise.as_ref() else {
            return;
        };

        match promise.state() {
            PromiseState::Pending => {}
            PromiseState::Success => {
                match promise.new_sensor_alert() {
                    Some(new_sensor_alert) => {
                        debug!(
                            sensor_alert_id = self.init.sensor_alert_id,
                            alert_level = promise.alert_level(),
                            "Adopting instrumented sensor alert"
                        );
                        self.current = new_sensor_alert;
                    }
                    None => self.drop_instrumented_levels(snapshot),
                }
                self.instrumentation_processed = true;
            }
            PromiseState::Failed => {
                self.drop_instrumented_levels(snapshot);
                self.instrumentation_processed = true;
            }
        }
    }

    fn drop_instrumented_levels(&mut self, snapshot: &EvaluationSnapshot) {
        self.suitable_alert_levels.retain(|level| {
            snapshot
                .alert_level(*level)
                .map(|l| !l.instrumentation_active())
                .unwrap_or(false)
        });
    }

    /// Does this state wait for an instrumentation to be started?
    pub fn needs_instrumentation(&self) -> bool {
        self.uses_instrumentation
            && !self.instrumentation_processed
            && self.instrumentation.is_none()
            && self.suitable_alert_levels.len() == 1
    }

    /// Start the instrumentation of the single suitable alert level
    pub fn start_instrumentation(
        &mut self,
        alert_level: &AlertLevel,
        runner: &InstrumentationRunner,
    ) -> Result<InstrumentationPromise, StateError> {
        let sensor_alert_id = self.init.sensor_alert_id;
        if self.instrumentation.is_some() || self.promise.is_some() {
            return Err(StateError::AlreadyAttached(sensor_alert_id));
        }
        if !self.uses_instrumentation || !alert_level.instrumentation_active() {
            return Err(StateError::NotInstrumented(sensor_alert_id));
        }
        if self.suitable_alert_levels != [alert_level.level] {
            return Err(StateError::AmbiguousAlertLevel {
                sensor_alert_id,
                count: self.suitable_alert_levels.len(),
            });
        }

        let mut instrumentation = Instrumentation::new(alert_level.clone(), self.current.clone());
        let promise = instrumentation.execute(runner);
        self.instrumentation = Some(instrumentation);
        self.promise = Some(promise.clone());
        Ok(promise)
    }

    /// Storage id of the originating sensor alert
    pub fn sensor_alert_id(&self) -> i64 {
        self.init.sensor_alert_id
    }

    /// The event as loaded from storage
    pub fn init_sensor_alert(&self) -> &SensorAlert {
        &self.init
    }

    /// The event that currently governs this state
    pub fn sensor_alert(&self) -> &SensorAlert {
        &self.current
    }

    /// Alert levels at construction
    pub fn alert_levels(&self) -> &[u32] {
        &self.alert_levels
    }

    /// Alert levels that currently qualify
    pub fn suitable_alert_levels(&self) -> &[u32] {
        &self.suitable_alert_levels
    }

    /// Is this state bound to one instrumented alert level?
    pub fn uses_instrumentation(&self) -> bool {
        self.uses_instrumentation
    }

    /// Has the instrumentation produced a verdict (or was none needed)?
    pub fn instrumentation_processed(&self) -> bool {
        self.instrumentation_processed
    }

    /// Promise of the attached instrumentation
    pub fn instrumentation_promise(&self) -> Option<&InstrumentationPromise> {
        self.promise.as_ref()
    }

    /// Is the attached instrumentation still running?
    pub fn is_instrumentation_running(&self) -> bool {
        self.instrumentation.as_ref().map(Instrumentation::is_running).unwrap_or(false)
    }

    /// Has the alert delay passed at UTC second `now`?
    pub fn is_alert_delay_passed(&self, now: i64) -> bool {
        now >= self.init.time_received.saturating_add(self.init.alert_delay)
    }

    /// Nothing can qualify any more
    pub fn is_dropped(&self) -> bool {
        self.suitable_alert_levels.is_empty()
    }

    /// Delay passed and instrumentation verdict available
    pub fn is_ready(&self, now: i64) -> bool {
        self.instrumentation_processed && self.is_alert_delay_passed(now)
    }
}

impl std::fmt::Debug for SensorAlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorAlertState")
            .field("sensor_alert_id", &self.init.sensor_alert_id)
            .field("suitable_alert_levels", &self.suitable_alert_levels)
            .field("uses_instrumentation", &self.uses_instrumentation)
            .field("instrumentation_processed", &self.instrumentation_processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::level::InstrumentationConfig;
    use crate::alert::sensor_alert::tests::sample_sensor_alert;
    use crate::alert::sensor_alert::SensorState;
    use serde_json::json;
    use std::path::PathBuf;

    fn levels(instrumented: &[u32], plain: &[u32]) -> Arc<BTreeMap<u32, AlertLevel>> {
        let mut map = BTreeMap::new();
        for &level in plain {
            map.insert(level, AlertLevel::new(level, "Plain"));
        }
        for &level in instrumented {
            let mut alert_level = AlertLevel::new(level, "Instrumented");
            alert_level.instrumentation = Some(InstrumentationConfig {
                cmd: PathBuf::from("/bin/true"),
                args: vec![],
                timeout_secs: 5,
            });
            map.insert(level, alert_level);
        }
        Arc::new(map)
    }

    fn alert_with_levels(alert_levels: Vec<u32>) -> SensorAlert {
        let mut alert = sample_sensor_alert();
        alert.alert_levels = alert_levels;
        alert
    }

    #[test]
    fn test_unknown_levels_dropped_at_construction() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[], &[1, 2]));
        let state = SensorAlertState::new(alert_with_levels(vec![1, 2, 42]), &snapshot);

        assert_eq!(state.alert_levels(), &[1, 2]);
        assert!(!state.uses_instrumentation());
        assert!(state.instrumentation_processed());
    }

    #[test]
    fn test_profile_and_direction_filter() {
        let mut map = (*levels(&[], &[1, 2, 3])).clone();
        map.get_mut(&2).unwrap().profiles = vec![1];
        map.get_mut(&3).unwrap().trigger_on_triggered = false;
        let snapshot = EvaluationSnapshot::new(0, Arc::new(map));

        let mut state = SensorAlertState::new(alert_with_levels(vec![1, 2, 3]), &snapshot);
        state.update_suitable_alert_levels(&snapshot);

        assert_eq!(state.suitable_alert_levels(), &[1]);
        assert_eq!(state.sensor_alert().triggered_alert_levels, vec![1]);
        assert!(state.init_sensor_alert().triggered_alert_levels.is_empty());
    }

    #[test]
    fn test_suitable_levels_only_narrow() {
        let alert_levels = levels(&[], &[1]);
        let away = EvaluationSnapshot::new(5, alert_levels.clone());
        let home = EvaluationSnapshot::new(0, alert_levels);

        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &home);
        state.update_suitable_alert_levels(&away);
        state.update_suitable_alert_levels(&home);

        assert!(state.is_dropped());
    }

    #[test]
    fn test_split_instrumented_levels() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1, 2], &[3, 4]));
        let state = SensorAlertState::new(alert_with_levels(vec![1, 2, 3, 4]), &snapshot);

        let states = state.split_instrumented(&snapshot);
        assert_eq!(states.len(), 3);

        assert_eq!(states[0].suitable_alert_levels(), &[1]);
        assert!(states[0].uses_instrumentation());
        assert!(states[0].needs_instrumentation());
        assert_eq!(states[1].suitable_alert_levels(), &[2]);
        assert_eq!(states[2].suitable_alert_levels(), &[3, 4]);
        assert!(!states[2].uses_instrumentation());
        assert!(states.iter().all(|s| s.sensor_alert_id() == 7));
    }

    #[test]
    fn test_split_only_instrumented_levels() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1, 2], &[]));
        let state = SensorAlertState::new(alert_with_levels(vec![1, 2]), &snapshot);

        let states = state.split_instrumented(&snapshot);
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(SensorAlertState::uses_instrumentation));
    }

    #[test]
    fn test_split_single_level_unchanged() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);
        assert!(state.uses_instrumentation());

        let states = state.split_instrumented(&snapshot);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].suitable_alert_levels(), &[1]);
    }

    #[test]
    fn test_derived_states_are_independent() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1, 2], &[]));
        let state = SensorAlertState::new(alert_with_levels(vec![1, 2]), &snapshot);
        let mut states = state.split_instrumented(&snapshot);

        // Resolve the first with a mutated event, the second with the plain copy
        let mut mutated = states[0].sensor_alert().clone();
        mutated.optional_data = Some(json!({"timestamp": 1}));
        let first = InstrumentationPromise::new(1);
        first.set_success(Some(mutated)).unwrap();
        states[0].promise = Some(first);

        let second = InstrumentationPromise::new(2);
        second.set_success(Some(states[1].sensor_alert().clone())).unwrap();
        states[1].promise = Some(second);

        for state in states.iter_mut() {
            state.update_suitable_alert_levels(&snapshot);
        }

        assert_eq!(
            states[0].sensor_alert().optional_data,
            Some(json!({"timestamp": 1}))
        );
        assert_eq!(states[1].sensor_alert().optional_data, sample_sensor_alert().optional_data);
        assert_eq!(states[0].init_sensor_alert().optional_data, sample_sensor_alert().optional_data);
    }

    #[test]
    fn test_pending_instrumentation_retained() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);
        state.promise = Some(InstrumentationPromise::new(1));

        state.update_suitable_alert_levels(&snapshot);

        assert_eq!(state.suitable_alert_levels(), &[1]);
        assert!(!state.instrumentation_processed());
        assert!(!state.is_ready(i64::MAX));
    }

    #[test]
    fn test_failed_instrumentation_drops_level() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);
        let promise = InstrumentationPromise::new(1);
        promise.set_failed().unwrap();
        state.promise = Some(promise);

        state.update_suitable_alert_levels(&snapshot);

        assert!(state.is_dropped());
        assert!(state.instrumentation_processed());
    }

    #[test]
    fn test_suppressing_instrumentation_drops_level() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);
        let promise = InstrumentationPromise::new(1);
        promise.set_success(None).unwrap();
        state.promise = Some(promise);

        state.update_suitable_alert_levels(&snapshot);
        assert!(state.is_dropped());
    }

    #[test]
    fn test_toggled_state_rechecked() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);

        let mut toggled = state.sensor_alert().clone();
        toggled.state = SensorState::Normal;
        let promise = InstrumentationPromise::new(1);
        promise.set_success(Some(toggled)).unwrap();
        state.promise = Some(promise);

        state.update_suitable_alert_levels(&snapshot);

        // Level reacts to "triggered" only
        assert!(state.is_dropped());
        assert_eq!(state.init_sensor_alert().state, SensorState::Triggered);
    }

    #[test]
    fn test_alert_delay() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[], &[1]));
        let mut alert = alert_with_levels(vec![1]);
        alert.time_received = 100;
        alert.alert_delay = 5;
        let state = SensorAlertState::new(alert, &snapshot);

        assert!(!state.is_ready(104));
        assert!(state.is_ready(105));
    }

    #[test]
    fn test_huge_alert_delay_does_not_overflow() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[], &[1]));
        let mut alert = alert_with_levels(vec![1]);
        alert.time_received = 1000;
        alert.alert_delay = i64::MAX;
        let state = SensorAlertState::new(alert, &snapshot);

        assert!(!state.is_alert_delay_passed(2000));
        assert!(!state.is_ready(2000));
    }

    #[test]
    fn test_unarmed_profile_beats_pending_instrumentation() {
        let alert_levels = levels(&[1], &[]);
        let home = EvaluationSnapshot::new(0, alert_levels.clone());
        let away = EvaluationSnapshot::new(1, alert_levels);

        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &home);
        let promise = InstrumentationPromise::new(1);
        state.promise = Some(promise.clone());

        state.update_suitable_alert_levels(&home);
        assert_eq!(state.suitable_alert_levels(), &[1]);

        // Profile switched while the instrumentation is still running
        state.update_suitable_alert_levels(&away);
        assert!(state.is_dropped());

        promise.set_success(Some(sample_sensor_alert())).unwrap();
        state.update_suitable_alert_levels(&home);
        assert!(state.is_dropped());
        assert!(state.instrumentation_processed());
    }

    #[tokio::test]
    async fn test_start_instrumentation_once() {
        let snapshot = EvaluationSnapshot::new(0, levels(&[1], &[]));
        let mut state = SensorAlertState::new(alert_with_levels(vec![1]), &snapshot);
        let runner = InstrumentationRunner::new(1);
        let alert_level = snapshot.alert_level(1).unwrap().clone();

        assert!(state.start_instrumentation(&alert_level, &runner).is_ok());
        assert!(!state.needs_instrumentation());
        assert_eq!(
            state.start_instrumentation(&alert_level, &runner).err(),
            Some(StateError::AlreadyAttached(7))
        );
    }
}
