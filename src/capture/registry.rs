//! Maps configured camera kinds to driver constructors.

use std::collections::HashMap;
use std::sync::Arc;

use super::camera::{CameraDevice, CameraDriver, CameraError, SimulatedDriver};

type DriverFactory = Box<dyn Fn() -> Arc<dyn CameraDriver> + Send + Sync>;

/// Registry of camera drivers keyed by the `kind` string of the
/// configuration file.
///
/// Drivers are constructed lazily and cached, so each kind is resolved once
/// per registry.
pub struct CameraRegistry {
    factories: HashMap<String, DriverFactory>,
    resolved: HashMap<String, Arc<dyn CameraDriver>>,
}

impl CameraRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Registers (or replaces) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn CameraDriver> + Send + Sync + 'static,
    {
        let kind = kind.into();
        self.resolved.remove(&kind);
        self.factories.insert(kind, Box::new(factory));
    }

    /// Registers an already constructed driver instance.
    pub fn register_driver(&mut self, kind: impl Into<String>, driver: Arc<dyn CameraDriver>) {
        let kind = kind.into();
        self.factories.remove(&kind);
        self.resolved.insert(kind, driver);
    }

    /// Known kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .factories
            .keys()
            .chain(self.resolved.keys())
            .cloned()
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Resolves the driver for `kind`.
    pub fn driver(&mut self, kind: &str) -> Result<Arc<dyn CameraDriver>, CameraError> {
        if let Some(driver) = self.resolved.get(kind) {
            return Ok(Arc::clone(driver));
        }
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| CameraError::DeviceNotFound(format!("no driver for camera kind '{kind}'")))?;
        let driver = factory();
        self.resolved.insert(kind.to_string(), Arc::clone(&driver));
        tracing::debug!(kind, "Resolved camera driver");
        Ok(driver)
    }

    /// Opens a device of the given kind.
    pub fn open(&mut self, kind: &str, selector: &str) -> Result<Box<dyn CameraDevice>, CameraError> {
        self.driver(kind)?.open(selector)
    }
}

impl Default for CameraRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("simulated", || Arc::new(SimulatedDriver::new()));
        registry
    }
}

impl std::fmt::Debug for CameraRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
