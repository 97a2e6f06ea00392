// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! Alert level instrumentation
//!
//! Runs the external program configured for an alert level against one
//! sensor alert. The program receives the sensor alert as a JSON object on
//! stdin (plus `instrumentationAlertLevel`) and answers on stdout with the
//! same shape, possibly mutated. `{}` suppresses the sensor alert; anything
//! else that is not a valid answer counts as failure.

use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::level::AlertLevel;
use super::promise::InstrumentationPromise;
use super::sensor_alert::SensorAlert;

/// Maximum stdout or stderr size captured per stream (1 MiB)
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Key added to the payload so the program knows which alert level it runs for
pub const INSTRUMENTATION_ALERT_LEVEL_KEY: &str = "instrumentationAlertLevel";

/// Reasons an instrumentation fails
#[derive(Debug, Error)]
pub enum InstrumentationError {
    /// Alert level without instrumentation
    #[error("alert level {0} has no instrumentation configured")]
    NotConfigured(u32),

    /// Program could not be started
    #[error("executing instrumentation failed: {0}")]
    Spawn(#[source] std::io::Error),

    /// Pipe I/O failed
    #[error("communicating with instrumentation failed: {0}")]
    Io(#[source] std::io::Error),

    /// Killed after the timeout
    #[error("instrumentation timed out after {timeout_secs} seconds")]
    Timeout {
        /// Configured timeout
        timeout_secs: u64,
    },

    /// Non-zero exit code
    #[error("instrumentation exited with exit code {exit_code}")]
    ExitCode {
        /// Exit code, -1 when killed by a signal
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    /// Nothing on stdout
    #[error("instrumentation produced no output")]
    EmptyOutput {
        /// Captured stderr
        stderr: String,
    },

    /// Output failed verification
    #[error("invalid instrumentation output: {0}")]
    InvalidOutput(String),
}

/// Receives instrumentation failures, e.g. to raise an internal sensor alert
pub trait InstrumentationErrorReporter: Send + Sync {
    /// Called once per failed run
    fn report(&self, alert_level: &AlertLevel, error: &InstrumentationError);
}

/// One instrumentation run for one (alert level, sensor alert) pairing
pub struct Instrumentation {
    alert_level: AlertLevel,
    sensor_alert: SensorAlert,
    promise: InstrumentationPromise,
    task: Option<JoinHandle<()>>,
}

impl Instrumentation {
    /// Instrumentation of `sensor_alert` for `alert_level`, not started yet
    pub fn new(alert_level: AlertLevel, sensor_alert: SensorAlert) -> Self {
        let promise = InstrumentationPromise::new(alert_level.level);
        Self {
            alert_level,
            sensor_alert,
            promise,
            task: None,
        }
    }

    /// Alert level being instrumented
    pub fn alert_level(&self) -> &AlertLevel {
        &self.alert_level
    }

    /// Promise resolved when the run ends
    pub fn promise(&self) -> InstrumentationPromise {
        self.promise.clone()
    }

    /// Is the program still running or waiting for a slot?
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Start the instrumentation on the runner's worker pool without blocking.
    /// Calling it again returns the promise of the first run.
    pub fn execute(&mut self, runner: &InstrumentationRunner) -> InstrumentationPromise {
        if self.task.is_none() {
            let alert_level = self.alert_level.clone();
            let sensor_alert = self.sensor_alert.clone();
            let promise = self.promise.clone();
            let permits = runner.permits.clone();
            let reporter = runner.reporter.clone();

            self.task = Some(tokio::spawn(async move {
                // Closed semaphore means the runner is shutting down
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = promise.set_failed();
                        return;
                    }
                };
                run(&alert_level, &sensor_alert, &promise, reporter.as_deref()).await;
            }));
        }
        self.promise.clone()
    }
}

/// Bounded worker pool for instrumentation processes
#[derive(Clone)]
pub struct InstrumentationRunner {
    permits: Arc<Semaphore>,
    reporter: Option<Arc<dyn InstrumentationErrorReporter>>,
}

impl InstrumentationRunner {
    /// Pool running at most `max_concurrent` programs at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            reporter: None,
        }
    }

    /// Report failures to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn InstrumentationErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Free slots
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Fail all instrumentations still waiting for a slot
    pub fn close(&self) {
        self.permits.close();
    }
}

async fn run(
    alert_level: &AlertLevel,
    sensor_alert: &SensorAlert,
    promise: &InstrumentationPromise,
    reporter: Option<&dyn InstrumentationErrorReporter>,
) {
    let result = execute_program(alert_level, sensor_alert).await;

    let resolved = match result {
        Ok(new_sensor_alert) => {
            if new_sensor_alert.is_none() {
                debug!(
                    alert_level = alert_level.level,
                    sensor_alert_id = sensor_alert.sensor_alert_id,
                    "Instrumentation suppressed sensor alert"
                );
            }
            promise.set_success(new_sensor_alert)
        }
        Err(e) => {
            match &e {
                InstrumentationError::ExitCode { stderr, .. } | InstrumentationError::EmptyOutput { stderr } => {
                    warn!(alert_level = alert_level.level, stderr = %stderr, "Instrumentation failed: {}", e);
                }
                _ => warn!(alert_level = alert_level.level, "Instrumentation failed: {}", e),
            }
            if let Some(reporter) = reporter {
                reporter.report(alert_level, &e);
            }
            promise.set_failed()
        }
    };

    if let Err(e) = resolved {
        error!(alert_level = alert_level.level, "Unable to resolve instrumentation promise: {}", e);
    }
}

/// Build the JSON payload written to the program's stdin
pub fn build_payload(alert_level: &AlertLevel, sensor_alert: &SensorAlert) -> Result<Value, InstrumentationError> {
    let mut payload = serde_json::to_value(sensor_alert)
        .map_err(|e| InstrumentationError::InvalidOutput(format!("unable to serialize sensor alert: {}", e)))?;

    if let Value::Object(map) = &mut payload {
        map.remove("triggeredAlertLevels");
        map.insert(INSTRUMENTATION_ALERT_LEVEL_KEY.to_string(), Value::from(alert_level.level));
    }
    Ok(payload)
}

async fn execute_program(
    alert_level: &AlertLevel,
    sensor_alert: &SensorAlert,
) -> Result<Option<SensorAlert>, InstrumentationError> {
    let config = alert_level
        .instrumentation
        .as_ref()
        .ok_or(InstrumentationError::NotConfigured(alert_level.level))?;

    let payload = build_payload(alert_level, sensor_alert)?;
    let payload = serde_json::to_vec(&payload)
        .map_err(|e| InstrumentationError::InvalidOutput(format!("unable to encode payload: {}", e)))?;

    let mut cmd = Command::new(&config.cmd);
    cmd.args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so a timeout takes down everything the program spawned
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(
        alert_level = alert_level.level,
        cmd = %config.cmd.display(),
        "Executing instrumentation"
    );

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(InstrumentationError::Spawn)?;
    let pid = child.id();

    // Written off the wait path so a program that never reads its input
    // still runs into the timeout. Write errors mean the program exited early.
    let stdin_task = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            let _ = stdin.write_all(&payload).await;
        })
    });

    let mut stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let mut stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    // The timeout bounds the whole run including both output streams
    let run = async {
        let status = child.wait().await.map_err(InstrumentationError::Io)?;
        // Leftover background processes would hold the pipes open
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        let stdout = (&mut stdout_task).await.unwrap_or_default();
        let stderr = (&mut stderr_task).await.unwrap_or_default();
        Ok::<_, InstrumentationError>((status, stdout, stderr))
    };
    let result = tokio::time::timeout(config.timeout(), run).await;

    if let Some(task) = &stdin_task {
        task.abort();
    }

    let (status, stdout, stderr) = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(e);
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(InstrumentationError::Timeout {
                timeout_secs: config.timeout_secs,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

    debug!(
        alert_level = alert_level.level,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Instrumentation finished"
    );

    let exit_code = status.code().unwrap_or(-1);
    if exit_code != 0 {
        return Err(InstrumentationError::ExitCode { exit_code, stderr });
    }

    if stdout.is_empty() {
        return Err(InstrumentationError::EmptyOutput { stderr });
    }

    process_output(alert_level, sensor_alert, &stdout)
}

/// Parse and verify the program's answer.
///
/// Returns `Ok(None)` when the program suppressed the sensor alert.
pub fn process_output(
    alert_level: &AlertLevel,
    orig: &SensorAlert,
    output: &str,
) -> Result<Option<SensorAlert>, InstrumentationError> {
    let invalid = |msg: &str| InstrumentationError::InvalidOutput(msg.to_string());

    let value: Value = serde_json::from_str(output)
        .map_err(|e| InstrumentationError::InvalidOutput(format!("not JSON: {}", e)))?;

    let mut map = match value {
        Value::Null => return Ok(None),
        Value::Object(map) if map.is_empty() => return Ok(None),
        Value::Object(map) => map,
        _ => return Err(invalid("expected a JSON object")),
    };

    match map.remove(INSTRUMENTATION_ALERT_LEVEL_KEY) {
        None => return Err(invalid("instrumentationAlertLevel missing")),
        Some(level) if level.as_u64() != Some(u64::from(alert_level.level)) => {
            return Err(invalid("instrumentationAlertLevel not allowed to change"));
        }
        Some(_) => {}
    }
    map.remove("triggeredAlertLevels");

    let mut new_sensor_alert: SensorAlert = serde_json::from_value(Value::Object(map))
        .map_err(|e| InstrumentationError::InvalidOutput(format!("malformed sensor alert: {}", e)))?;

    new_sensor_alert
        .validate()
        .map_err(|e| InstrumentationError::InvalidOutput(e.to_string()))?;

    if new_sensor_alert.node_id != orig.node_id {
        return Err(invalid("nodeId not allowed to change"));
    }
    if new_sensor_alert.sensor_id != orig.sensor_id {
        return Err(invalid("sensorId not allowed to change"));
    }
    if new_sensor_alert.description != orig.description {
        return Err(invalid("description not allowed to change"));
    }
    if new_sensor_alert.time_received != orig.time_received {
        return Err(invalid("timeReceived not allowed to change"));
    }
    if new_sensor_alert.alert_delay != orig.alert_delay {
        return Err(invalid("alertDelay not allowed to change"));
    }
    if !new_sensor_alert.same_alert_levels(orig) {
        return Err(invalid("alertLevels not allowed to change"));
    }
    if new_sensor_alert.data_type != orig.data_type {
        return Err(invalid("dataType not allowed to change"));
    }

    new_sensor_alert.sensor_alert_id = orig.sensor_alert_id;
    new_sensor_alert.triggered_alert_levels = Vec::new();

    Ok(Some(new_sensor_alert))
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg only sends a signal; the group id is the child's pid
    // because the child was spawned with process_group(0).
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        debug!(pid, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
