//! Device capability seams.
//!
//! The engine does not talk wire protocols; it talks to capability traits.
//! A device is an addressable controllable quantity, and drivers implement
//! only the capabilities they actually support:
//!
//! - a motor axis or setpoint channel implements [`Settable`]
//! - a readback or detector channel implements [`Readable`]
//! - a simulated axis implements both
//!
//! # Contract
//!
//! - All methods are async and take `&self`; drivers use interior mutability
//!   for state.
//! - `set` returns once the write is accepted by the device, which may block
//!   for the device's settle time. The engine never interrupts an in-flight
//!   `set`.
//! - Errors are driver-shaped (`anyhow`); the engine wraps them with the
//!   device name when failing a run.

use anyhow::Result;
use async_trait::async_trait;

/// Capability: accepts written values.
#[async_trait]
pub trait Settable: Send + Sync {
    /// Write a value to the device, waiting for the device to accept it.
    async fn set(&self, value: f64) -> Result<()>;
}

/// Capability: produces scalar readings.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the device's current value.
    async fn read(&self) -> Result<f64>;
}
