//! Interface handles: claiming, alternate settings, endpoint lists
//!
//! An [`Interface`] covers every alternate setting sharing one interface
//! number. Its endpoint list always reflects the currently selected
//! alternate setting; switching settings rebuilds the list so stale handles
//! never linger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::device::Session;
use crate::endpoint::Endpoint;
use crate::engine::{DeviceIdent, TransferEngine};
use crate::error::{Result, UsageError};
use usb_wire::{InterfaceAltSetting, InterfaceGroup};

/// One interface of the active configuration
pub struct Interface {
    engine: Arc<dyn TransferEngine>,
    ident: DeviceIdent,
    session: Arc<Session>,
    group: InterfaceGroup,
    current_alt: Mutex<u8>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    claimed: AtomicBool,
}

impl Interface {
    pub(crate) fn new(
        engine: Arc<dyn TransferEngine>,
        ident: DeviceIdent,
        session: Arc<Session>,
        group: InterfaceGroup,
    ) -> Self {
        // Descriptor order puts the default setting first.
        let current_alt = group
            .alt_settings
            .first()
            .map(|alt| alt.alternate_setting)
            .unwrap_or(0);
        let endpoints = group
            .alt_settings
            .first()
            .map(|alt| Self::build_endpoints(&engine, &ident, &session, alt))
            .unwrap_or_default();

        Self {
            engine,
            ident,
            session,
            group,
            current_alt: Mutex::new(current_alt),
            endpoints: Mutex::new(endpoints),
            claimed: AtomicBool::new(false),
        }
    }

    /// Interface number (bInterfaceNumber).
    pub fn number(&self) -> u8 {
        self.group.number
    }

    /// Every alternate setting declared for this interface number.
    pub fn alt_settings(&self) -> &[InterfaceAltSetting] {
        &self.group.alt_settings
    }

    /// Value of the currently selected alternate setting.
    pub fn current_alt_setting(&self) -> u8 {
        *self.current_alt.lock().unwrap()
    }

    /// Descriptor of the currently selected alternate setting.
    pub fn descriptor(&self) -> InterfaceAltSetting {
        let alt = self.current_alt_setting();
        self.group
            .alt_settings
            .iter()
            .find(|setting| setting.alternate_setting == alt)
            .cloned()
            .unwrap_or_else(|| self.group.alt_settings[0].clone())
    }

    /// Endpoint handles of the currently selected alternate setting.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Look up an endpoint by its address (direction bit included).
    pub fn endpoint(&self, address: u8) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .find(|endpoint| endpoint.address() == address)
            .cloned()
    }

    /// Whether this handle currently holds the interface claim.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Claim the interface for exclusive use.
    pub fn claim(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.engine.claim_interface(&self.ident, self.group.number)?;
        self.claimed.store(true, Ordering::Relaxed);
        debug!(interface = self.group.number, "interface claimed");
        Ok(())
    }

    /// Release a previously claimed interface.
    ///
    /// Fails while any endpoint still has an Active or Draining streaming
    /// session; use [`Interface::release_and_drain`] to stop and wait first.
    pub fn release(&self) -> Result<()> {
        self.session.ensure_open()?;
        if self.has_live_streams() {
            return Err(UsageError::StreamsActive.into());
        }
        self.engine
            .release_interface(&self.ident, self.group.number)?;
        self.claimed.store(false, Ordering::Relaxed);
        debug!(interface = self.group.number, "interface released");
        Ok(())
    }

    /// Stop every live streaming session, wait for the drains, then release.
    pub async fn release_and_drain(&self) -> Result<()> {
        self.session.ensure_open()?;

        let endpoints = self.endpoints();
        for endpoint in &endpoints {
            endpoint.stop_poll_if_live();
        }
        for endpoint in &endpoints {
            endpoint.wait_poll_end().await;
        }
        self.release()
    }

    /// Activate an alternate setting and rebuild the endpoint list.
    ///
    /// Fails before any native call when `alt` is not declared by this
    /// interface or while streaming sessions are live. On native failure the
    /// prior setting and endpoint list stay in place.
    pub fn set_alt_setting(&self, alt: u8) -> Result<()> {
        self.session.ensure_open()?;

        let setting = self
            .group
            .alt_settings
            .iter()
            .find(|setting| setting.alternate_setting == alt)
            .ok_or(UsageError::UnknownAltSetting {
                interface: self.group.number,
                alt,
            })?;
        if self.has_live_streams() {
            return Err(UsageError::StreamsActive.into());
        }

        self.engine
            .set_alt_setting(&self.ident, self.group.number, alt)?;

        *self.current_alt.lock().unwrap() = alt;
        *self.endpoints.lock().unwrap() =
            Self::build_endpoints(&self.engine, &self.ident, &self.session, setting);
        debug!(
            interface = self.group.number,
            alt, "alternate setting activated"
        );
        Ok(())
    }

    /// Whether a kernel driver is bound to this interface.
    pub fn kernel_driver_active(&self) -> Result<bool> {
        self.session.ensure_open()?;
        Ok(self
            .engine
            .kernel_driver_active(&self.ident, self.group.number)?)
    }

    /// Unbind the kernel driver so the interface can be claimed.
    pub fn detach_kernel_driver(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.engine
            .detach_kernel_driver(&self.ident, self.group.number)?;
        Ok(())
    }

    /// Rebind the kernel driver after use.
    pub fn attach_kernel_driver(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.engine
            .attach_kernel_driver(&self.ident, self.group.number)?;
        Ok(())
    }

    fn has_live_streams(&self) -> bool {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .any(|endpoint| endpoint.has_live_pool())
    }

    fn build_endpoints(
        engine: &Arc<dyn TransferEngine>,
        ident: &DeviceIdent,
        session: &Arc<Session>,
        alt: &InterfaceAltSetting,
    ) -> Vec<Arc<Endpoint>> {
        alt.endpoints
            .iter()
            .map(|descriptor| {
                Arc::new(Endpoint::new(
                    Arc::clone(engine),
                    ident.clone(),
                    Arc::clone(session),
                    *descriptor,
                ))
            })
            .collect()
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("number", &self.group.number)
            .field("alt", &self.current_alt_setting())
            .field("claimed", &self.is_claimed())
            .finish()
    }
}
