//! Scan executor.
//!
//! Walks a command tree in order, drives devices through the registry, and
//! reports progress to subscribers. One engine runs one scan at a time on a
//! single sequential worker; `pause`, `resume`, and `abort` are requests
//! from other tasks, observed at command boundaries and between loop steps
//! so that an in-flight device write is never interrupted.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start()   ┌─────────┐ pause() at boundary ┌────────┐
//! │ Idle │───────────▶│ Running │────────────────────▶│ Paused │
//! └──────┘            └────┬────┘◀────resume()────────└────────┘
//!                          │
//!                          │ completed / failed / abort()
//!                          ▼
//!             { Finished | Failed | Aborted }
//! ```
//!
//! Terminal states count as "not running": the next `start` is accepted
//! from any of them.
//!
//! # Run state
//!
//! Commands carry configuration only. Everything mutable about a run — the
//! current address, loop iteration values, and the direction toggles of
//! mismatched loops — lives in a per-run cursor keyed by command address,
//! created at `start` and discarded when the run ends. Re-running a tree
//! therefore starts from clean state.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use scan_core::command::ScanCommand;
use scan_core::error::{ScanError, ScanResult};
use scan_core::tree::{CommandAddress, ScanTree};
use scan_hardware::DeviceRegistry;

use crate::event::{CommandStatus, ScanEvent};

/// How often a paused worker re-checks for resume/abort.
const PAUSE_POLL: Duration = Duration::from_millis(25);
/// How often a wait command re-reads its device.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Engine run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// No scan has run yet.
    Idle,
    /// Executing commands.
    Running,
    /// Paused at a command boundary; resume or abort.
    Paused,
    /// Abort requested, waiting for the current command to complete.
    Aborting,
    /// Last run completed every command.
    Finished,
    /// Last run stopped on a device or command error.
    Failed,
    /// Last run was aborted.
    Aborted,
}

impl ScanState {
    /// Whether a run is in progress (terminal states and `Idle` are not).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScanState::Running | ScanState::Paused | ScanState::Aborting
        )
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanState::Idle => "idle",
            ScanState::Running => "running",
            ScanState::Paused => "paused",
            ScanState::Aborting => "aborting",
            ScanState::Finished => "finished",
            ScanState::Failed => "failed",
            ScanState::Aborted => "aborted",
        };
        write!(f, "{label}")
    }
}

/// Result of a completed (not failed) run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Identifier assigned at start.
    pub run_id: String,
    /// Terminal state: `Finished` or `Aborted`.
    pub state: ScanState,
    /// Commands completed over the whole run.
    pub commands_done: u64,
}

/// Outcome of one execution step: keep going or stop for an abort.
enum Flow {
    Continue,
    Abort,
}

/// Engine state and control requests, updated atomically.
struct Control {
    state: ScanState,
    pause_requested: bool,
    abort_requested: bool,
}

/// Per-run mutable execution state.
///
/// Anything keyed per command is keyed by its address, so the same tree can
/// be run again (or by another engine) without contamination from this run.
struct Cursor {
    run_id: String,
    commands_done: u64,
    current: Option<CommandAddress>,
    /// Active loop frames, outermost first: `(loop address, current value)`.
    loop_values: Vec<(CommandAddress, f64)>,
    /// Direction toggles for loops whose step sign disagrees with their
    /// bounds. Absent means "not yet reversed".
    reverse: HashMap<CommandAddress, bool>,
}

impl Cursor {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            commands_done: 0,
            current: None,
            loop_values: Vec::new(),
            reverse: HashMap::new(),
        }
    }
}

/// The scan executor.
pub struct ScanEngine {
    registry: Arc<DeviceRegistry>,
    control: RwLock<Control>,
    events: broadcast::Sender<ScanEvent>,
    cursor: Mutex<Option<Cursor>>,
}

impl ScanEngine {
    /// Create an engine over a device registry.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            registry,
            control: RwLock::new(Control {
                state: ScanState::Idle,
                pause_requested: false,
                abort_requested: false,
            }),
            events,
            cursor: Mutex::new(None),
        }
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Current engine state.
    pub async fn state(&self) -> ScanState {
        self.control.read().await.state
    }

    /// Identifier of the active run, if any.
    pub async fn current_run_id(&self) -> Option<String> {
        self.cursor.lock().await.as_ref().map(|c| c.run_id.clone())
    }

    /// Address of the command currently executing, if a run is active.
    pub async fn current_address(&self) -> Option<CommandAddress> {
        self.cursor.lock().await.as_ref().and_then(|c| c.current.clone())
    }

    /// Active loop frames, outermost first: `(loop address, current value)`.
    pub async fn loop_values(&self) -> Vec<(CommandAddress, f64)> {
        self.cursor
            .lock()
            .await
            .as_ref()
            .map(|c| c.loop_values.clone())
            .unwrap_or_default()
    }

    /// Commands completed so far in the active run.
    pub async fn commands_done(&self) -> u64 {
        self.cursor
            .lock()
            .await
            .as_ref()
            .map(|c| c.commands_done)
            .unwrap_or(0)
    }

    /// Run a tree to completion.
    ///
    /// Validates the tree, takes ownership of it (structural edits fail
    /// with `TreeLocked` until the run ends), and executes on the calling
    /// task. Returns the run summary for finished and aborted runs; a
    /// device or command failure is returned as the error after the run
    /// has transitioned to `Failed`.
    pub async fn start(&self, tree: Arc<RwLock<ScanTree>>) -> ScanResult<RunSummary> {
        {
            let mut control = self.control.write().await;
            if control.state.is_active() {
                return Err(ScanError::AlreadyRunning {
                    state: control.state.to_string(),
                });
            }
            control.state = ScanState::Running;
            control.pause_requested = false;
            control.abort_requested = false;
        }

        // Take ownership of the tree for the duration of the run and
        // snapshot its commands; the lock flag keeps editors out.
        let commands = {
            let mut guard = tree.write().await;
            match Self::claim_tree(&mut guard) {
                Ok(commands) => commands,
                Err(err) => {
                    drop(guard);
                    self.control.write().await.state = ScanState::Idle;
                    return Err(err);
                }
            }
        };

        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, commands = commands.len(), "Scan started");
        *self.cursor.lock().await = Some(Cursor::new(run_id.clone()));
        self.emit(ScanEvent::RunStarted {
            run_id: run_id.clone(),
        });
        self.emit(ScanEvent::StateChanged {
            state: ScanState::Running,
        });

        let outcome = self.execute_body(&commands, None).await;

        let commands_done = self
            .cursor
            .lock()
            .await
            .take()
            .map(|c| c.commands_done)
            .unwrap_or(0);
        tree.write().await.unlock();

        let (final_state, failure) = match outcome {
            Ok(Flow::Continue) => (ScanState::Finished, None),
            Ok(Flow::Abort) => (ScanState::Aborted, None),
            Err(err) => (ScanState::Failed, Some(err)),
        };
        self.control.write().await.state = final_state;
        self.emit(ScanEvent::StateChanged { state: final_state });
        self.emit(ScanEvent::RunStopped {
            run_id: run_id.clone(),
            state: final_state,
            commands_done,
        });

        match failure {
            None => {
                info!(run_id = %run_id, state = %final_state, commands_done, "Scan ended");
                Ok(RunSummary {
                    run_id,
                    state: final_state,
                    commands_done,
                })
            }
            Some(err) => {
                error!(run_id = %run_id, error = %err, "Scan failed");
                Err(err)
            }
        }
    }

    fn claim_tree(tree: &mut ScanTree) -> ScanResult<Vec<ScanCommand>> {
        tree.validate()?;
        tree.lock()?;
        Ok(tree.commands().to_vec())
    }

    /// Request a pause at the next command boundary.
    pub async fn pause(&self) -> ScanResult<()> {
        let mut control = self.control.write().await;
        if control.state != ScanState::Running {
            return Err(ScanError::InvalidStateTransition {
                state: control.state.to_string(),
                request: "pause".into(),
            });
        }
        info!("Pause requested");
        control.pause_requested = true;
        Ok(())
    }

    /// Resume a paused run.
    ///
    /// Also valid while a pause request has not yet taken effect, in which
    /// case the request is simply withdrawn.
    pub async fn resume(&self) -> ScanResult<()> {
        let mut control = self.control.write().await;
        match control.state {
            ScanState::Paused => {
                control.pause_requested = false;
                control.state = ScanState::Running;
                info!("Resuming");
                self.emit(ScanEvent::StateChanged {
                    state: ScanState::Running,
                });
                Ok(())
            }
            ScanState::Running if control.pause_requested => {
                control.pause_requested = false;
                Ok(())
            }
            other => Err(ScanError::InvalidStateTransition {
                state: other.to_string(),
                request: "resume".into(),
            }),
        }
    }

    /// Request an abort.
    ///
    /// The run transitions to `Aborting` immediately and to `Aborted` once
    /// the command in flight has completed; no command is dropped mid-write.
    pub async fn abort(&self, reason: &str) -> ScanResult<()> {
        let mut control = self.control.write().await;
        match control.state {
            ScanState::Running | ScanState::Paused => {
                info!(reason, "Abort requested");
                control.abort_requested = true;
                control.state = ScanState::Aborting;
                self.emit(ScanEvent::StateChanged {
                    state: ScanState::Aborting,
                });
                Ok(())
            }
            other => Err(ScanError::InvalidStateTransition {
                state: other.to_string(),
                request: "abort".into(),
            }),
        }
    }

    /// Observe control requests at a command boundary.
    ///
    /// Blocks while paused; returns `Flow::Abort` when an abort request is
    /// pending.
    async fn checkpoint(&self) -> Flow {
        {
            let mut control = self.control.write().await;
            if control.abort_requested {
                return Flow::Abort;
            }
            if !control.pause_requested {
                return Flow::Continue;
            }
            control.state = ScanState::Paused;
            info!("Scan paused");
        }
        self.emit(ScanEvent::StateChanged {
            state: ScanState::Paused,
        });
        loop {
            sleep(PAUSE_POLL).await;
            let control = self.control.read().await;
            if control.abort_requested {
                return Flow::Abort;
            }
            if control.state == ScanState::Running {
                return Flow::Continue;
            }
        }
    }

    /// Execute a command sequence in order, addressing children of `parent`.
    fn execute_body<'a>(
        &'a self,
        commands: &'a [ScanCommand],
        parent: Option<&'a CommandAddress>,
    ) -> BoxFuture<'a, ScanResult<Flow>> {
        Box::pin(async move {
            for (index, command) in commands.iter().enumerate() {
                let address = match parent {
                    Some(base) => base.child(index),
                    None => CommandAddress::top(index),
                };
                if matches!(self.checkpoint().await, Flow::Abort) {
                    return Ok(Flow::Abort);
                }
                if let Some(cursor) = self.cursor.lock().await.as_mut() {
                    cursor.current = Some(address.clone());
                }
                self.emit(ScanEvent::CommandStarted {
                    address: address.clone(),
                });
                match self.execute_command(command, &address).await {
                    Ok(Flow::Continue) => {
                        if let Some(cursor) = self.cursor.lock().await.as_mut() {
                            cursor.commands_done += 1;
                        }
                        self.emit(ScanEvent::CommandFinished {
                            address,
                            status: CommandStatus::Done,
                        });
                    }
                    Ok(Flow::Abort) => {
                        self.emit(ScanEvent::CommandFinished {
                            address,
                            status: CommandStatus::Aborted,
                        });
                        return Ok(Flow::Abort);
                    }
                    Err(err) => {
                        self.emit(ScanEvent::CommandFinished {
                            address,
                            status: CommandStatus::Failed {
                                message: err.to_string(),
                            },
                        });
                        return Err(err);
                    }
                }
            }
            Ok(Flow::Continue)
        })
    }

    async fn execute_command(
        &self,
        command: &ScanCommand,
        address: &CommandAddress,
    ) -> ScanResult<Flow> {
        debug!(address = %address, command = %command, "Executing");
        match command {
            ScanCommand::Set { device, value } => {
                self.set_device(device, *value).await?;
                Ok(Flow::Continue)
            }
            ScanCommand::Wait {
                device,
                value,
                tolerance,
                timeout_secs,
            } => {
                self.wait_condition(device, *value, *tolerance, *timeout_secs)
                    .await?;
                Ok(Flow::Continue)
            }
            ScanCommand::Delay { seconds } => {
                if seconds.is_finite() && *seconds > 0.0 {
                    sleep(Duration::from_secs_f64(*seconds)).await;
                }
                Ok(Flow::Continue)
            }
            ScanCommand::Log { devices } => {
                let mut readings = Vec::with_capacity(devices.len());
                for device in devices {
                    readings.push((device.clone(), self.read_device(device).await?));
                }
                self.emit(ScanEvent::DeviceReadings {
                    address: address.clone(),
                    readings,
                });
                Ok(Flow::Continue)
            }
            ScanCommand::Loop {
                device,
                start,
                end,
                step,
                body,
            } => {
                self.execute_loop(address, device, *start, *end, *step, body)
                    .await
            }
            ScanCommand::Script { .. } => Err(ScanError::UnsupportedCommand {
                kind: command.kind().into(),
            }),
        }
    }

    /// Run one loop command: infer direction, step the device, execute the
    /// body once per value.
    async fn execute_loop(
        &self,
        address: &CommandAddress,
        device: &str,
        start: f64,
        end: f64,
        step: f64,
        body: &[ScanCommand],
    ) -> ScanResult<Flow> {
        // Direction is inferred when the loop starts, not at construction.
        let matched = (start <= end && step > 0.0) || (start >= end && step < 0.0);
        let (from, to, step) = if matched {
            (start, end, step)
        } else {
            // The step sign wins this time; the toggle makes the next
            // execution of this same loop within the run go the other way.
            let reverse = self.toggle_reverse(address).await;
            let descending = (step < 0.0) != reverse;
            debug!(address = %address, descending, "Loop step sign disagrees with bounds");
            let (lo, hi) = (start.min(end), start.max(end));
            if descending {
                (hi, lo, -step.abs())
            } else {
                (lo, hi, step.abs())
            }
        };

        if let Some(cursor) = self.cursor.lock().await.as_mut() {
            cursor.loop_values.push((address.clone(), from));
        }

        let mut value = from;
        let flow = loop {
            let in_range = if step > 0.0 { value <= to } else { value >= to };
            if !in_range {
                break Flow::Continue;
            }
            if matches!(self.checkpoint().await, Flow::Abort) {
                break Flow::Abort;
            }
            if let Some(cursor) = self.cursor.lock().await.as_mut() {
                if let Some(frame) = cursor.loop_values.last_mut() {
                    frame.1 = value;
                }
            }
            self.set_device(device, value).await?;
            match self.execute_body(body, Some(address)).await? {
                Flow::Continue => {}
                Flow::Abort => break Flow::Abort,
            }
            value += step;
        };

        if let Some(cursor) = self.cursor.lock().await.as_mut() {
            cursor.loop_values.pop();
        }
        Ok(flow)
    }

    /// Read and flip the reverse toggle for a mismatched loop.
    async fn toggle_reverse(&self, address: &CommandAddress) -> bool {
        let mut cursor = self.cursor.lock().await;
        match cursor.as_mut() {
            Some(cursor) => {
                let flag = cursor.reverse.entry(address.clone()).or_insert(false);
                let current = *flag;
                *flag = !current;
                current
            }
            None => false,
        }
    }

    async fn set_device(&self, device: &str, value: f64) -> ScanResult<()> {
        let handle = self
            .registry
            .get_settable(device)
            .ok_or_else(|| ScanError::NoSuchDevice {
                device: device.into(),
            })?;
        debug!(device, value, "Setting device");
        handle.set(value).await.map_err(|err| ScanError::Device {
            device: device.into(),
            message: err.to_string(),
        })
    }

    async fn read_device(&self, device: &str) -> ScanResult<f64> {
        let handle = self
            .registry
            .get_readable(device)
            .ok_or_else(|| ScanError::NoSuchDevice {
                device: device.into(),
            })?;
        handle.read().await.map_err(|err| ScanError::Device {
            device: device.into(),
            message: err.to_string(),
        })
    }

    /// Poll a device until its reading is within tolerance of the desired
    /// value, or the timeout expires.
    async fn wait_condition(
        &self,
        device: &str,
        value: f64,
        tolerance: f64,
        timeout_secs: f64,
    ) -> ScanResult<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs.max(0.0));
        loop {
            let reading = self.read_device(device).await?;
            if (reading - value).abs() <= tolerance {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScanError::Device {
                    device: device.into(),
                    message: format!(
                        "timed out after {timeout_secs} s waiting for {value} (last reading {reading})"
                    ),
                });
            }
            sleep(WAIT_POLL).await;
        }
    }

    fn emit(&self, event: ScanEvent) {
        // Send errors mean no subscribers; progress is best-effort.
        let _ = self.events.send(event);
    }
}
