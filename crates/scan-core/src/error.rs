//! Central error type for the scan system.
//!
//! One enum covers the three places errors originate: structural edits of a
//! command tree, the exchange codec, and the execution engine. Structural and
//! validation errors are raised synchronously at the point of mutation or at
//! run start; device errors only occur while a scan is running and are
//! terminal for that run.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for the scan system.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Insertion index is outside the target body's bounds, or the target
    /// command cannot hold children.
    #[error("Invalid position: {detail}")]
    InvalidPosition { detail: String },

    /// A command address no longer resolves to a command,
    /// e.g. the command was already removed.
    #[error("No command at address {address}")]
    NotFound { address: String },

    /// The tree is owned by an executor for the duration of a run;
    /// structural edits are rejected until the run ends.
    #[error("Tree is locked by a running scan")]
    TreeLocked,

    /// The codec met a command tag it does not know.
    /// The whole decode is abandoned; no partial tree is returned.
    #[error("Unknown command '{tag}'")]
    UnknownCommand { tag: String },

    /// A command block was structurally broken (missing tag, wrong field
    /// type, non-list body).
    #[error("Malformed command block: {0}")]
    MalformedBlock(String),

    /// Underlying serialization failure.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// File-level save/load failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A loop with a zero step size can never advance.
    /// Rejected uniformly at mutation, decode, and run start.
    #[error("Malformed loop for device '{device}': step size must be non-zero")]
    MalformedLoop { device: String },

    /// A device operation failed or timed out during a run.
    #[error("Device '{device}' error: {message}")]
    Device { device: String, message: String },

    /// No device registered under the requested name, or it lacks the
    /// needed capability.
    #[error("No device '{device}' with the required capability")]
    NoSuchDevice { device: String },

    /// `start` was called while a run is active.
    #[error("Scan already running (state: {state})")]
    AlreadyRunning { state: String },

    /// A control request that is not valid in the current state,
    /// e.g. `abort` while idle or `resume` while running.
    #[error("Cannot {request} while {state}")]
    InvalidStateTransition { state: String, request: String },

    /// A known-but-opaque command reached the executor.
    #[error("Command '{kind}' is not executable by this engine")]
    UnsupportedCommand { kind: String },

    /// Device registry configuration was syntactically valid but
    /// semantically wrong.
    #[error("Configuration error: {0}")]
    Configuration(String),
}
