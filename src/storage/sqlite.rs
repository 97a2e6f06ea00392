// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! SQLite storage backend

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Sensor, Storage};
use crate::alert::{SensorAlert, SensorData, SensorDataType, SensorState};
use crate::config::DatabaseConfig;

/// rusqlite-backed storage; one connection shared behind a lock
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create the database file
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let storage = Self::from_connection(conn)?;
        info!("Database opened at {:?}", config.path);
        Ok(storage)
    }

    /// Throwaway database, used by tests and tools
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open a database file at `path` with default settings
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: path.to_path_buf(),
        })
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.create_tables()?;
        Ok(storage)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                sensor_id INTEGER PRIMARY KEY,
                node_id INTEGER NOT NULL,
                description TEXT NOT NULL,
                alert_delay INTEGER NOT NULL,
                alert_levels TEXT NOT NULL,
                state INTEGER NOT NULL,
                data_type INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sensor_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                sensor_id INTEGER NOT NULL,
                time_received INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sensor_alerts_sensor ON sensor_alerts(sensor_id);

            CREATE TABLE IF NOT EXISTS options (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )?;

        Ok(())
    }

    /// Insert or replace a sensor
    pub fn upsert_sensor(&self, sensor: &Sensor) -> Result<()> {
        if sensor.data.data_type() != sensor.data_type {
            bail!(
                "sensor {} data does not match data type {:?}",
                sensor.sensor_id,
                sensor.data_type
            );
        }

        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO sensors
               (sensor_id, node_id, description, alert_delay, alert_levels, state, data_type, data)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                sensor.sensor_id,
                sensor.node_id,
                sensor.description,
                sensor.alert_delay,
                serde_json::to_string(&sensor.alert_levels)?,
                u8::from(sensor.state),
                u8::from(sensor.data_type),
                serde_json::to_string(&sensor.data)?,
            ],
        )?;

        debug!(sensor_id = sensor.sensor_id, "Sensor stored");
        Ok(())
    }

    /// Persist a new sensor state
    pub fn update_sensor_state(&self, sensor_id: i64, state: SensorState) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sensors SET state = ?1 WHERE sensor_id = ?2",
            params![u8::from(state), sensor_id],
        )?;
        if changed == 0 {
            bail!("unknown sensor {}", sensor_id);
        }
        Ok(())
    }

    /// Persist new sensor data; its type must match the sensor
    pub fn update_sensor_data(&self, sensor_id: i64, data: &SensorData) -> Result<()> {
        let conn = self.conn.lock();
        let data_type: Option<u8> = conn
            .query_row(
                "SELECT data_type FROM sensors WHERE sensor_id = ?1",
                params![sensor_id],
                |row| row.get(0),
            )
            .optional()?;

        let data_type = data_type.ok_or_else(|| anyhow!("unknown sensor {}", sensor_id))?;
        if SensorDataType::try_from(data_type)? != data.data_type() {
            bail!("sensor {} data does not match data type", sensor_id);
        }

        conn.execute(
            "UPDATE sensors SET data = ?1 WHERE sensor_id = ?2",
            params![serde_json::to_string(data)?, sensor_id],
        )?;
        Ok(())
    }

    fn row_to_sensor(row: &rusqlite::Row<'_>) -> Result<Sensor> {
        let alert_levels: String = row.get(4)?;
        let state: u8 = row.get(5)?;
        let data_type: u8 = row.get(6)?;
        let data: String = row.get(7)?;

        Ok(Sensor {
            sensor_id: row.get(0)?,
            node_id: row.get(1)?,
            description: row.get(2)?,
            alert_delay: row.get(3)?,
            alert_levels: serde_json::from_str(&alert_levels)?,
            state: SensorState::try_from(state)?,
            data_type: SensorDataType::try_from(data_type)?,
            data: serde_json::from_str(&data)?,
        })
    }
}

const SENSOR_COLUMNS: &str =
    "sensor_id, node_id, description, alert_delay, alert_levels, state, data_type, data";

impl Storage for SqliteStorage {
    fn add_sensor_alert(&self, sensor_alert: &SensorAlert) -> Result<i64> {
        let body = serde_json::to_string(sensor_alert)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sensor_alerts (node_id, sensor_id, time_received, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                sensor_alert.node_id,
                sensor_alert.sensor_id,
                sensor_alert.time_received,
                body
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_pending_sensor_alerts(&self) -> Result<Vec<SensorAlert>> {
        let conn = self.conn.lock();

        let mut results = Vec::new();
        let mut malformed = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT id, body FROM sensor_alerts ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

            for row in rows {
                let (id, body) = row?;
                match serde_json::from_str::<SensorAlert>(&body) {
                    Ok(mut sensor_alert) => {
                        sensor_alert.sensor_alert_id = id;
                        results.push(sensor_alert);
                    }
                    Err(e) => {
                        warn!(sensor_alert_id = id, "Removing malformed sensor alert row: {}", e);
                        malformed.push(id);
                    }
                }
            }
        }

        // Rows that never decode would otherwise be read again on every pass
        for id in malformed {
            conn.execute("DELETE FROM sensor_alerts WHERE id = ?1", params![id])?;
        }

        Ok(results)
    }

    fn remove_sensor_alert(&self, sensor_alert_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sensor_alerts WHERE id = ?1", params![sensor_alert_id])?;
        Ok(())
    }

    fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sensors WHERE sensor_id = ?1", SENSOR_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![sensor_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_sensor(row)?)),
            None => Ok(None),
        }
    }

    fn get_sensors(&self) -> Result<Vec<Sensor>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sensors ORDER BY sensor_id", SENSOR_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(Self::row_to_sensor(row)?);
        }
        Ok(results)
    }

    fn get_sensor_state(&self, sensor_id: i64) -> Result<SensorState> {
        let conn = self.conn.lock();
        let state: Option<u8> = conn
            .query_row(
                "SELECT state FROM sensors WHERE sensor_id = ?1",
                params![sensor_id],
                |row| row.get(0),
            )
            .optional()?;

        let state = state.ok_or_else(|| anyhow!("unknown sensor {}", sensor_id))?;
        Ok(SensorState::try_from(state)?)
    }

    fn get_sensor_data(&self, sensor_id: i64) -> Result<SensorData> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM sensors WHERE sensor_id = ?1",
                params![sensor_id],
                |row| row.get(0),
            )
            .optional()?;

        let data = data.ok_or_else(|| anyhow!("unknown sensor {}", sensor_id))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn get_option(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM options WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update_option(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT OR REPLACE INTO options (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
            params![key, value],
        )?;

        Ok(())
    }
}
