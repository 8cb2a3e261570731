//! Progress events emitted while a scan runs.
//!
//! Subscribers (operator UIs, logs, data sinks) receive these over a
//! broadcast channel; a slow consumer lags and catches up, it never stalls
//! the execution worker. Events are serializable so transports can forward
//! them unchanged.

use serde::{Deserialize, Serialize};

use scan_core::tree::CommandAddress;

use crate::engine::ScanState;

/// How a command's execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    /// Completed normally.
    Done,
    /// Interrupted by an abort request before completing.
    Aborted,
    /// Failed; the run is over.
    Failed {
        /// What went wrong.
        message: String,
    },
}

/// One progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A run began.
    RunStarted {
        /// Identifier for this run.
        run_id: String,
    },
    /// The engine changed state.
    StateChanged { state: ScanState },
    /// A command began executing.
    CommandStarted { address: CommandAddress },
    /// A command finished executing.
    CommandFinished {
        address: CommandAddress,
        status: CommandStatus,
    },
    /// Readings reported by a log command.
    DeviceReadings {
        address: CommandAddress,
        /// `(device, value)` pairs in command order.
        readings: Vec<(String, f64)>,
    },
    /// The run reached a terminal state.
    RunStopped {
        run_id: String,
        state: ScanState,
        /// Commands completed over the whole run.
        commands_done: u64,
    },
}
