// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! AlertR engine - owns the workers and their shutdown

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{EventBus, SystemState};
use crate::alert::{
    EventBusDispatcher, ExecuterHandle, ExecuterStats, InstrumentationRunner, SensorAlertExecuter,
};
use crate::config::Config;
use crate::internal_sensors::InstrumentationErrorSensor;
use crate::manager::ManagerUpdateExecuter;
use crate::storage::{self, SqliteStorage, Storage, PROFILE_OPTION};

/// Main AlertR engine
pub struct Engine {
    /// Validated configuration
    pub config: Arc<Config>,
    storage: Arc<SqliteStorage>,
    bus: Arc<EventBus>,
    manager: Arc<ManagerUpdateExecuter>,
    handle: ExecuterHandle,
    stats: Arc<ExecuterStats>,
    executer: Option<SensorAlertExecuter>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    state: Arc<RwLock<SystemState>>,
    start_time: Option<Instant>,
}

impl Engine {
    /// Open the configured database and build the engine
    pub async fn new(config: Config) -> Result<Self> {
        let storage = SqliteStorage::open(&config.database)?;
        Self::with_storage(config, storage).await
    }

    /// Build the engine on an already opened storage
    pub async fn with_storage(config: Config, storage: SqliteStorage) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let storage = Arc::new(storage);

        // Seed the active profile on first start
        if storage.get_option(PROFILE_OPTION)?.is_none() {
            let profile = config
                .profiles
                .first()
                .map(|p| p.id)
                .unwrap_or_default();
            storage.update_option(PROFILE_OPTION, &profile.to_string())?;
            info!(profile, "Active profile initialized");
        }

        let bus = Arc::new(EventBus::new(config.engine.event_capacity));
        let manager = Arc::new(ManagerUpdateExecuter::new(
            storage.clone(),
            bus.clone(),
            config.manager.update_interval(),
        ));

        let wake = Arc::new(Notify::new());
        let handle = ExecuterHandle::new(storage.clone(), wake.clone());

        let mut runner = InstrumentationRunner::new(config.engine.max_concurrent_instrumentations);
        if let Some(sensor_config) = &config.internal_sensors.instrumentation_error {
            let sensor = InstrumentationErrorSensor::new(sensor_config.clone(), handle.clone());
            sensor.register(&storage)?;
            runner = runner.with_reporter(Arc::new(sensor));
            info!(
                sensor_id = sensor_config.sensor_id,
                "Instrumentation error sensor registered"
            );
        }

        let executer = SensorAlertExecuter::new(
            &config,
            storage.clone(),
            Arc::new(EventBusDispatcher::new(bus.clone())),
            manager.clone(),
            runner,
        )
        .with_wake(wake);
        let stats = executer.stats();

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            bus,
            manager,
            handle,
            stats,
            executer: Some(executer),
            shutdown_tx,
            tasks: Vec::new(),
            state: Arc::new(RwLock::new(SystemState::default())),
            start_time: None,
        })
    }

    /// Spawn the executer and manager workers
    pub async fn start(&mut self) -> Result<()> {
        let Some(mut executer) = self.executer.take() else {
            bail!("engine already started");
        };

        info!("Starting AlertR engine...");
        self.start_time = Some(Instant::now());

        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            executer.run(shutdown).await;
        }));

        let manager = self.manager.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            manager.run(shutdown).await;
        }));

        {
            let mut state = self.state.write().await;
            state.running = true;
        }

        // Pick up sensor alerts persisted while the engine was down
        self.handle.wake();

        info!("AlertR engine started");
        Ok(())
    }

    /// Signal shutdown and wait for the workers
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping AlertR engine...");

        let _ = self.shutdown_tx.send(());
        for result in futures::future::join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                warn!("Worker ended abnormally: {}", e);
            }
        }

        {
            let mut state = self.state.write().await;
            state.running = false;
        }

        info!("AlertR engine stopped");
        Ok(())
    }

    /// Switch the active profile and re-evaluate pending sensor alerts
    pub async fn change_profile(&self, profile: u32) -> Result<()> {
        let Some(entry) = self.config.profile(profile) else {
            bail!("unknown profile {}", profile);
        };

        self.storage.update_option(PROFILE_OPTION, &profile.to_string())?;
        info!(profile, "Active profile changed to '{}'", entry.name);

        self.bus.publish_profile_changed(profile, &entry.name);
        self.manager.force_status_update();
        self.handle.wake();
        Ok(())
    }

    /// Snapshot of the engine state
    pub async fn state(&self) -> SystemState {
        let mut state = self.state.read().await.clone();
        state.active_profile = storage::active_profile(self.storage.as_ref()).ok();
        state.pending_states = self.stats.pending_states();
        state.total_triggered = self.stats.total_triggered();
        state.total_dropped = self.stats.total_dropped();
        state.total_manager_updates = self.stats.total_manager_updates();
        state.uptime_seconds = self.uptime();
        state.last_trigger = self.stats.last_trigger();
        state
    }

    /// Seconds since start
    pub fn uptime(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Producer handle for protocol receivers and internal sensors
    pub fn handle(&self) -> ExecuterHandle {
        self.handle.clone()
    }

    /// Event bus
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Storage backend
    pub fn storage(&self) -> Arc<SqliteStorage> {
        self.storage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertLevel, NewSensorAlert, SensorState};
    use crate::core::EventType;
    use crate::storage::tests::sample_sensor;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.alert_levels = vec![AlertLevel::new(1, "Home only")];
        config.engine.poll_interval_ms = 20;
        config.engine.idle_wait_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_seeds_profile_and_changes_it() {
        let engine = Engine::with_storage(config(), SqliteStorage::open_in_memory().unwrap())
            .await
            .unwrap();
        assert_eq!(engine.state().await.active_profile, Some(0));

        let mut rx = engine.bus().subscribe_events();
        engine.change_profile(1).await.unwrap();
        assert_eq!(engine.state().await.active_profile, Some(1));
        assert!(engine.change_profile(9).await.is_err());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ProfileChanged);
    }

    #[tokio::test]
    async fn test_start_trigger_stop() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.upsert_sensor(&sample_sensor(3, vec![1])).unwrap();

        let mut engine = Engine::with_storage(config(), storage).await.unwrap();
        let mut triggered = engine.bus().subscribe_triggered();
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());
        assert!(engine.state().await.running);

        engine
            .handle()
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

        let alert = tokio::time::timeout(Duration::from_secs(5), triggered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.alert_level, 1);
        assert_eq!(alert.sensor_alert.sensor_id, 3);

        engine.stop().await.unwrap();
        let state = engine.state().await;
        assert!(!state.running);
        assert_eq!(state.total_triggered, 1);
    }

    #[tokio::test]
    async fn test_profile_change_drops_pending_alert() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut sensor = sample_sensor(3, vec![1]);
        sensor.alert_delay = 30;
        storage.upsert_sensor(&sensor).unwrap();

        let mut engine = Engine::with_storage(config(), storage).await.unwrap();
        engine.start().await.unwrap();

        engine
            .handle()
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
        engine.change_profile(1).await.unwrap();

        for _ in 0..250 {
            if engine.state().await.total_dropped > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        engine.stop().await.unwrap();
        let state = engine.state().await;
        assert_eq!(state.total_dropped, 1);
        assert_eq!(state.total_manager_updates, 1);
        assert!(engine.storage().get_pending_sensor_alerts().unwrap().is_empty());
        assert_eq!(engine.state().await.total_triggered, 0);
    }
}
