//! Host context: enumeration and hotplug entry point

use std::sync::Arc;

use tracing::warn;

use crate::backend::RusbEngine;
use crate::device::Device;
use crate::engine::TransferEngine;
use crate::error::Result;
use crate::hotplug::{HotplugGate, HotplugWatcher};

/// Entry point of the host model
///
/// Owns the transfer engine and the hotplug gate. Device handles created
/// through a context share its engine.
pub struct HostContext {
    engine: Arc<dyn TransferEngine>,
    hotplug: Arc<HotplugGate>,
}

impl HostContext {
    /// Create a context backed by the rusb transfer engine.
    pub fn new() -> Result<Self> {
        Ok(Self::with_engine(Arc::new(RusbEngine::new()?)))
    }

    /// Create a context over an arbitrary transfer engine.
    ///
    /// This is how tests drive the model through a scripted engine.
    pub fn with_engine(engine: Arc<dyn TransferEngine>) -> Self {
        let hotplug = HotplugGate::new(Arc::clone(&engine));
        Self { engine, hotplug }
    }

    /// Enumerate the devices currently on the bus.
    ///
    /// Devices whose descriptor cannot be read (typically racing a
    /// disconnect) are skipped with a warning rather than failing the whole
    /// enumeration.
    pub fn devices(&self) -> Result<Vec<Arc<Device>>> {
        let idents = self.engine.list_devices()?;
        let mut devices = Vec::with_capacity(idents.len());
        for ident in idents {
            match Device::new(Arc::clone(&self.engine), ident.clone()) {
                Ok(device) => devices.push(device),
                Err(err) => {
                    warn!(device = %ident, error = %err, "skipping unreadable device");
                }
            }
        }
        Ok(devices)
    }

    /// Find the first device matching a vendor/product pair.
    pub fn find_device(&self, vendor_id: u16, product_id: u16) -> Result<Option<Arc<Device>>> {
        Ok(self.devices()?.into_iter().find(|device| {
            device.descriptor().vendor_id == vendor_id
                && device.descriptor().product_id == product_id
        }))
    }

    /// Build a handle for one known device identity.
    pub fn device(&self, ident: &crate::engine::DeviceIdent) -> Result<Arc<Device>> {
        Device::new(Arc::clone(&self.engine), ident.clone())
    }

    /// Subscribe to device attach/detach events.
    ///
    /// The first subscription enables engine notifications; dropping the
    /// last watcher disables them again.
    pub fn watch_hotplug(&self) -> Result<HotplugWatcher> {
        HotplugGate::watch(&self.hotplug)
    }
}
