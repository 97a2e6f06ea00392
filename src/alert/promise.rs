// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Single-resolution promise for instrumentation results

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

use super::sensor_alert::SensorAlert;

/// Resolution state of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not resolved yet
    Pending,
    /// Instrumentation produced a verdict
    Success,
    /// Instrumentation failed
    Failed,
}

/// Misuse of a promise
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromiseError {
    /// Resolved a second time
    #[error("instrumentation promise already resolved as {0:?}")]
    AlreadyResolved(PromiseState),

    /// Still pending
    #[error("instrumentation not finished")]
    NotFinished,
}

struct Slot {
    state: PromiseState,
    new_sensor_alert: Option<SensorAlert>,
}

struct Inner {
    alert_level: u32,
    created_at: Instant,
    slot: Mutex<Slot>,
    finished: Condvar,
    notify: Notify,
}

/// Outcome of one instrumentation run.
///
/// Created `Pending` and resolved exactly once to `Success` or `Failed`.
/// Clones share the same resolution, so the runner keeps one handle and the
/// engine another.
#[derive(Clone)]
pub struct InstrumentationPromise {
    inner: Arc<Inner>,
}

impl InstrumentationPromise {
    /// New pending promise for an alert level
    pub fn new(alert_level: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                alert_level,
                created_at: Instant::now(),
                slot: Mutex::new(Slot {
                    state: PromiseState::Pending,
                    new_sensor_alert: None,
                }),
                finished: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Alert level whose instrumentation this promise observes
    pub fn alert_level(&self) -> u32 {
        self.inner.alert_level
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Current resolution
    pub fn state(&self) -> PromiseState {
        self.inner.slot.lock().state
    }

    /// Non-blocking poll
    pub fn is_finished(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    /// Resolve as success. `None` means the instrumentation suppressed the
    /// sensor alert.
    pub fn set_success(&self, new_sensor_alert: Option<SensorAlert>) -> Result<(), PromiseError> {
        self.resolve(PromiseState::Success, new_sensor_alert)
    }

    /// Resolve as failure
    pub fn set_failed(&self) -> Result<(), PromiseError> {
        self.resolve(PromiseState::Failed, None)
    }

    fn resolve(&self, state: PromiseState, new_sensor_alert: Option<SensorAlert>) -> Result<(), PromiseError> {
        {
            let mut slot = self.inner.slot.lock();
            if slot.state != PromiseState::Pending {
                return Err(PromiseError::AlreadyResolved(slot.state));
            }
            slot.state = state;
            slot.new_sensor_alert = new_sensor_alert;
        }
        self.inner.finished.notify_all();
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Did the instrumentation succeed? Errors while pending.
    pub fn was_success(&self) -> Result<bool, PromiseError> {
        match self.state() {
            PromiseState::Success => Ok(true),
            PromiseState::Failed => Ok(false),
            PromiseState::Pending => Err(PromiseError::NotFinished),
        }
    }

    /// Sensor alert produced by the instrumentation, `None` if it is still
    /// pending, failed or suppressed the sensor alert
    pub fn new_sensor_alert(&self) -> Option<SensorAlert> {
        self.inner.slot.lock().new_sensor_alert.clone()
    }

    /// Block the calling thread until resolved or `timeout` elapsed.
    /// Returns whether the promise is resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while slot.state == PromiseState::Pending {
            if self.inner.finished.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.state != PromiseState::Pending
    }

    /// Wait asynchronously until resolved
    pub async fn finished(&self) -> PromiseState {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if state != PromiseState::Pending {
                return state;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for InstrumentationPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationPromise")
            .field("alert_level", &self.inner.alert_level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::sensor_alert::tests::sample_sensor_alert;

    #[test]
    fn test_resolves_exactly_once() {
        let promise = InstrumentationPromise::new(1);
        assert_eq!(promise.state(), PromiseState::Pending);
        assert_eq!(promise.was_success(), Err(PromiseError::NotFinished));

        promise.set_failed().unwrap();
        assert!(promise.is_finished());
        assert_eq!(promise.was_success(), Ok(false));

        assert_eq!(
            promise.set_success(Some(sample_sensor_alert())),
            Err(PromiseError::AlreadyResolved(PromiseState::Failed))
        );
        assert!(promise.new_sensor_alert().is_none());
    }

    #[test]
    fn test_success_carries_sensor_alert() {
        let promise = InstrumentationPromise::new(1);
        let clone = promise.clone();

        clone.set_success(Some(sample_sensor_alert())).unwrap();

        assert_eq!(promise.was_success(), Ok(true));
        assert_eq!(promise.new_sensor_alert(), Some(sample_sensor_alert()));
    }

    #[test]
    fn test_wait_timeout_blocks_until_resolved() {
        let promise = InstrumentationPromise::new(1);
        assert!(!promise.wait_timeout(Duration::from_millis(20)));

        let writer = promise.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.set_success(None).unwrap();
        });

        assert!(promise.wait_timeout(Duration::from_secs(5)));
        assert_eq!(promise.state(), PromiseState::Success);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_finished_wakes_async_waiter() {
        let promise = InstrumentationPromise::new(4);
        let writer = promise.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set_failed().unwrap();
        });

        let state = tokio::time::timeout(Duration::from_secs(5), promise.finished())
            .await
            .unwrap();
        assert_eq!(state, PromiseState::Failed);
    }
}
