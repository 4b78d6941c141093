use std::collections::BTreeMap;

use log::info;

use crate::device::Device;
use crate::error::DeviceError;
use crate::mock::MockDevice;

/// Opens a device given a driver-specific target (a port, a URL, or nothing).
pub type DriverFactory = Box<dyn Fn(&str) -> Result<Box<dyn Device>, DeviceError> + Send + Sync>;

/// Named device drivers available to a session. Built once at startup and
/// handed to whoever opens devices.
pub struct DriverRegistry {
    drivers: BTreeMap<String, DriverFactory>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("mock", |_target| Ok(Box::new(MockDevice::new()) as Box<dyn Device>));
        registry
    }
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            drivers: BTreeMap::new(),
        }
    }

    /// Adds or replaces a driver.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Result<Box<dyn Device>, DeviceError> + Send + Sync + 'static,
    {
        self.drivers.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn open(&self, name: &str, target: &str) -> Result<Box<dyn Device>, DeviceError> {
        let factory = self
            .drivers
            .get(name)
            .ok_or_else(|| DeviceError::UnknownDriver(name.to_string()))?;
        let device = factory(target)?;
        info!("drivers: opened '{name}' {target}");
        Ok(device)
    }
}
