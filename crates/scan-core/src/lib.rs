//! Core types for scan automation: the command model, the command tree and
//! its mutation API, the exchange codec, the device capability seams, and
//! the central error type.
//!
//! This crate holds no hardware and no executor — `scan-hardware` provides
//! device drivers and the registry, `scan-engine` runs trees against them.

pub mod codec;
pub mod command;
pub mod device;
pub mod error;
pub mod tree;

pub use command::ScanCommand;
pub use device::{Readable, Settable};
pub use error::{ScanError, ScanResult};
pub use tree::{CommandAddress, ScanTree};
