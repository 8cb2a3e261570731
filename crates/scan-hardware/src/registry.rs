//! Device registry: runtime lookup from device names to capability handles.
//!
//! The engine resolves every device reference through the registry at the
//! moment a command executes; the registry maps an id to the capability
//! handles its driver provides. Devices are declared in configuration:
//!
//! ```toml
//! [[device]]
//! id = "xpos"
//! name = "Sample stage X"
//!
//! [device.driver]
//! type = "sim_axis"
//! initial = 0.0
//! settle_ms = 5
//! ```
//!
//! Driver configurations are validated before instantiation so that a bad
//! device file fails at load, not mid-scan.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use scan_core::device::{Readable, Settable};
use scan_core::error::{ScanError, ScanResult};

use crate::sim::{FlakyDevice, SimAxis, SimReadback};

/// Capabilities a registered device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Accepts written values.
    Settable,
    /// Produces scalar readings.
    Readable,
}

/// Driver configuration for instantiating a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// Simulated axis (settable + readable).
    SimAxis {
        /// Initial position.
        #[serde(default)]
        initial: f64,
        /// Settle delay applied to every write, in milliseconds.
        #[serde(default)]
        settle_ms: u64,
    },

    /// Simulated readback producing a fixed value (readable).
    SimReadback {
        /// The value every read returns.
        #[serde(default)]
        value: f64,
    },

    /// Settable device that errors after a number of writes.
    Flaky {
        /// Writes accepted before the device starts failing.
        fail_after: u32,
    },
}

impl DriverType {
    /// Capabilities this driver type provides.
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            DriverType::SimAxis { .. } => vec![Capability::Settable, Capability::Readable],
            DriverType::SimReadback { .. } => vec![Capability::Readable],
            DriverType::Flaky { .. } => vec![Capability::Settable],
        }
    }

    /// Human-readable driver type name.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::SimAxis { .. } => "sim_axis",
            DriverType::SimReadback { .. } => "sim_readback",
            DriverType::Flaky { .. } => "flaky",
        }
    }
}

/// One device declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Registry id, the name commands refer to.
    pub id: String,
    /// Human-readable device name.
    pub name: String,
    /// Driver to instantiate.
    pub driver: DriverType,
}

/// Validate a driver configuration before attempting to instantiate it.
pub fn validate_driver_config(config: &DeviceConfig) -> ScanResult<()> {
    if config.id.is_empty() {
        return Err(ScanError::Configuration("device id cannot be empty".into()));
    }
    if config
        .id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '_'))
    {
        return Err(ScanError::Configuration(format!(
            "device id '{}' must be alphanumeric/underscore",
            config.id
        )));
    }
    match &config.driver {
        DriverType::SimAxis { settle_ms, .. } => {
            if *settle_ms > 60_000 {
                return Err(ScanError::Configuration(format!(
                    "settle_ms {settle_ms} for '{}' is longer than a minute",
                    config.id
                )));
            }
        }
        DriverType::SimReadback { .. } | DriverType::Flaky { .. } => {}
    }
    Ok(())
}

/// Capability handles a driver exposes once instantiated.
#[derive(Default)]
struct DeviceComponents {
    settable: Option<Arc<dyn Settable>>,
    readable: Option<Arc<dyn Readable>>,
}

struct RegisteredDevice {
    name: String,
    capabilities: Vec<Capability>,
    components: DeviceComponents,
}

/// Summary of a registered device, for listings.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
}

/// Central id -> device map.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, RegisteredDevice>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and instantiate a device, registering its capabilities.
    pub fn register(&mut self, config: DeviceConfig) -> ScanResult<()> {
        validate_driver_config(&config)?;
        if self.devices.contains_key(&config.id) {
            return Err(ScanError::Configuration(format!(
                "device id '{}' registered twice",
                config.id
            )));
        }

        let components = match &config.driver {
            DriverType::SimAxis { initial, settle_ms } => {
                let axis = Arc::new(SimAxis::new(*initial, *settle_ms));
                DeviceComponents {
                    settable: Some(axis.clone()),
                    readable: Some(axis),
                }
            }
            DriverType::SimReadback { value } => DeviceComponents {
                readable: Some(Arc::new(SimReadback::new(*value))),
                ..Default::default()
            },
            DriverType::Flaky { fail_after } => DeviceComponents {
                settable: Some(Arc::new(FlakyDevice::new(*fail_after))),
                ..Default::default()
            },
        };

        info!(
            id = %config.id,
            driver = config.driver.driver_name(),
            "Registered device"
        );
        self.devices.insert(
            config.id,
            RegisteredDevice {
                name: config.name,
                capabilities: config.driver.capabilities(),
                components,
            },
        );
        Ok(())
    }

    /// Register an externally constructed driver under an id.
    ///
    /// This is the seam real instrument drivers (and test doubles) plug in
    /// through; the device must expose at least one capability.
    pub fn register_handles(
        &mut self,
        id: &str,
        name: &str,
        settable: Option<Arc<dyn Settable>>,
        readable: Option<Arc<dyn Readable>>,
    ) -> ScanResult<()> {
        if id.is_empty() {
            return Err(ScanError::Configuration("device id cannot be empty".into()));
        }
        if self.devices.contains_key(id) {
            return Err(ScanError::Configuration(format!(
                "device id '{id}' registered twice"
            )));
        }
        let mut capabilities = Vec::new();
        if settable.is_some() {
            capabilities.push(Capability::Settable);
        }
        if readable.is_some() {
            capabilities.push(Capability::Readable);
        }
        if capabilities.is_empty() {
            return Err(ScanError::Configuration(format!(
                "device '{id}' exposes no capability"
            )));
        }
        info!(id, "Registered device");
        self.devices.insert(
            id.to_string(),
            RegisteredDevice {
                name: name.to_string(),
                capabilities,
                components: DeviceComponents { settable, readable },
            },
        );
        Ok(())
    }

    /// Settable handle for a device, if it has that capability.
    pub fn get_settable(&self, id: &str) -> Option<Arc<dyn Settable>> {
        self.devices.get(id)?.components.settable.clone()
    }

    /// Readable handle for a device, if it has that capability.
    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.devices.get(id)?.components.readable.clone()
    }

    /// Whether a device id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Summaries of every registered device, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|(id, device)| DeviceInfo {
                id: id.clone(),
                name: device.name.clone(),
                capabilities: device.capabilities.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    device: Vec<DeviceConfig>,
}

/// Build a registry from a TOML device file.
pub fn load_registry(text: &str) -> ScanResult<DeviceRegistry> {
    let file: DeviceFile = toml::from_str(text)
        .map_err(|err| ScanError::Configuration(format!("device file: {err}")))?;
    let mut registry = DeviceRegistry::new();
    for config in file.device {
        registry.register(config)?;
    }
    Ok(registry)
}
