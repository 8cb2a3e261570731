//! Scan command model.
//!
//! A scan is an ordered, possibly nested sequence of commands. Each command
//! is one schedulable unit of work: write a device, wait for a condition,
//! iterate a device through a range while running a body sequence.
//!
//! Commands are a closed tagged-variant type rather than a trait object per
//! kind: the codec and the engine dispatch on the variant, and every variant
//! carries only the configuration it needs. Run state (loop direction
//! toggles, current iteration values) never lives on a command — it belongs
//! to the executor's per-run cursor, so the same tree can be run repeatedly
//! without cross-run contamination.

use serde::{Deserialize, Serialize};

fn default_tolerance() -> f64 {
    0.1
}

fn default_timeout() -> f64 {
    30.0
}

/// One schedulable unit in a scan sequence.
///
/// The serialized form is a tagged block: `{"command": "<tag>", ...fields}`,
/// with a `Loop` carrying its child commands in a nested `body` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ScanCommand {
    /// Write a value to a device.
    Set {
        /// Device to write.
        device: String,
        /// Value to write.
        value: f64,
    },

    /// Poll a device until its reading is within `tolerance` of `value`,
    /// failing the run after `timeout_secs`.
    Wait {
        /// Device to poll.
        device: String,
        /// Desired reading.
        value: f64,
        /// Acceptable distance from the desired reading.
        #[serde(default = "default_tolerance")]
        tolerance: f64,
        /// Seconds before the wait is declared failed.
        #[serde(default = "default_timeout")]
        timeout_secs: f64,
    },

    /// Pause execution for a fixed duration.
    Delay {
        /// Seconds to wait.
        seconds: f64,
    },

    /// Read the named devices and report their values to subscribers.
    Log {
        /// Devices to read.
        devices: Vec<String>,
    },

    /// Step a device from `start` to `end` by `step`, executing `body` once
    /// per step value.
    ///
    /// The loop stops at the end value: 1 to 5 by 1 visits 1, 2, 3, 4, 5;
    /// 1 to 6 by 2 visits 1, 3, 5. When the sign of the step disagrees with
    /// the ordering of start and end, the engine runs in the direction the
    /// step implies and alternates direction on each repeated execution
    /// within a run.
    Loop {
        /// Device updated with the loop value.
        device: String,
        /// Initial loop value.
        start: f64,
        /// Final loop value.
        end: f64,
        /// Loop increment. Must be non-zero.
        step: f64,
        /// Commands executed at each step, in order.
        #[serde(default)]
        body: Vec<ScanCommand>,
    },

    /// Opaque extension command. The payload round-trips through the codec
    /// unchanged; this engine does not execute it.
    Script {
        /// Script identifier.
        name: String,
        /// Opaque script text.
        source: String,
    },
}

impl ScanCommand {
    /// The serialized tag for this command.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanCommand::Set { .. } => "set",
            ScanCommand::Wait { .. } => "wait",
            ScanCommand::Delay { .. } => "delay",
            ScanCommand::Log { .. } => "log",
            ScanCommand::Loop { .. } => "loop",
            ScanCommand::Script { .. } => "script",
        }
    }

    /// One-line description for progress displays and logs.
    pub fn describe(&self) -> String {
        match self {
            ScanCommand::Set { device, value } => format!("Set '{device}' = {value}"),
            ScanCommand::Wait {
                device,
                value,
                tolerance,
                ..
            } => format!("Wait for '{device}' = {value} +- {tolerance}"),
            ScanCommand::Delay { seconds } => format!("Delay {seconds} s"),
            ScanCommand::Log { devices } => format!("Log {}", devices.join(", ")),
            ScanCommand::Loop {
                device,
                start,
                end,
                step,
                ..
            } => format!("Loop '{device}' = {start} ... {end}, step {step}"),
            ScanCommand::Script { name, .. } => format!("Script '{name}'"),
        }
    }

    /// Whether this command can hold child commands.
    pub fn is_container(&self) -> bool {
        matches!(self, ScanCommand::Loop { .. })
    }

    /// Child commands of a container, if any.
    pub fn body(&self) -> Option<&[ScanCommand]> {
        match self {
            ScanCommand::Loop { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn body_mut(&mut self) -> Option<&mut Vec<ScanCommand>> {
        match self {
            ScanCommand::Loop { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Check this command and every nested child for well-formedness.
    ///
    /// A zero step size can never advance a loop, so it is rejected here
    /// rather than defaulted — the same rule on every construction path.
    pub fn validate(&self) -> crate::error::ScanResult<()> {
        match self {
            ScanCommand::Loop {
                device, step, body, ..
            } => {
                if *step == 0.0 {
                    return Err(crate::error::ScanError::MalformedLoop {
                        device: device.clone(),
                    });
                }
                for child in body {
                    child.validate()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Total number of commands in this subtree, this command included.
    pub fn subtree_len(&self) -> usize {
        1 + self
            .body()
            .map(|b| b.iter().map(ScanCommand::subtree_len).sum())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}
