//! Device registry and simulated drivers.
//!
//! Maps device names to capability handles (`Settable` / `Readable` from
//! `scan-core`) and instantiates drivers from serde-tagged configuration.
//! Only simulated drivers live here; real instrument drivers would plug in
//! through the same `DriverType` dispatch.

pub mod registry;
pub mod sim;

pub use registry::{
    load_registry, validate_driver_config, Capability, DeviceConfig, DeviceInfo, DeviceRegistry,
    DriverType,
};
