//! Simulated devices for tests and demos.
//!
//! Real instrumentation sits behind the capability traits; these drivers
//! provide enough behavior to exercise the engine without hardware: an axis
//! that stores what it is told (after an optional settle delay), a fixed
//! readback, and a device that starts failing after a configured number of
//! writes.

use anyhow::Result;
use async_trait::async_trait;
use scan_core::device::{Readable, Settable};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Simulated axis: settable and readable, with a configurable settle time.
///
/// `set` sleeps for the settle time before the new value becomes readable,
/// standing in for a stage that takes a moment to arrive.
pub struct SimAxis {
    position: RwLock<f64>,
    settle: Duration,
}

impl SimAxis {
    pub fn new(initial: f64, settle_ms: u64) -> Self {
        Self {
            position: RwLock::new(initial),
            settle: Duration::from_millis(settle_ms),
        }
    }
}

#[async_trait]
impl Settable for SimAxis {
    async fn set(&self, value: f64) -> Result<()> {
        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }
        *self.position.write().await = value;
        debug!(value, "sim axis settled");
        Ok(())
    }
}

#[async_trait]
impl Readable for SimAxis {
    async fn read(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }
}

/// Simulated readback producing a fixed value.
pub struct SimReadback {
    value: f64,
}

impl SimReadback {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Readable for SimReadback {
    async fn read(&self) -> Result<f64> {
        Ok(self.value)
    }
}

/// Settable device that accepts a limited number of writes, then errors.
///
/// Exercises the run-failure path without hardware.
pub struct FlakyDevice {
    writes_left: Mutex<u32>,
}

impl FlakyDevice {
    pub fn new(fail_after: u32) -> Self {
        Self {
            writes_left: Mutex::new(fail_after),
        }
    }
}

#[async_trait]
impl Settable for FlakyDevice {
    async fn set(&self, value: f64) -> Result<()> {
        let mut left = self.writes_left.lock().await;
        if *left == 0 {
            anyhow::bail!("write of {value} rejected: device offline");
        }
        *left -= 1;
        Ok(())
    }
}
