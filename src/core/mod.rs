// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Core engine module - wires storage, executer and manager updates

mod engine;
mod event_bus;

pub use engine::Engine;
pub use event_bus::{Event, EventBus, EventPayload, EventType, TriggeredAlert};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemState {
    /// Are the workers running?
    pub running: bool,
    /// Active profile, if readable
    pub active_profile: Option<u32>,
    /// States waiting for delay or instrumentation
    pub pending_states: usize,
    /// Alert level dispatches
    pub total_triggered: u64,
    /// Dropped states
    pub total_dropped: u64,
    /// Manager updates queued
    pub total_manager_updates: u64,
    /// Seconds since start
    pub uptime_seconds: u64,
    /// Time of the last dispatch
    pub last_trigger: Option<DateTime<Utc>>,
}
