//! Device handles: descriptors, control transfers, interface model
//!
//! A [`Device`] wraps one device identity reported by the transfer engine.
//! Its 18-byte device descriptor is read eagerly at creation; the
//! configuration descriptor, the BOS descriptor, and the parent identity are
//! computed lazily and cached. Opening the device builds the interface
//! model from the active configuration; closing it tears that model down
//! and drops the BOS cache, which is only valid for an open session.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{DeviceIdent, TransferEngine};
use crate::error::{Result, TransferError, UsageError};
use crate::interface::Interface;
use crate::transfer::submit_and_wait;
use usb_wire::{
    BOS_HEADER_SIZE, BOS_MIN_BCD_USB, BosDescriptor, Capability, ConfigDescriptor,
    DeviceDescriptor, Direction, LANGUAGE_ID_EN_US, SETUP_PACKET_SIZE, SetupPacket, TransferKind,
    decode_string_descriptor, descriptor_type, read_total_length, standard_request,
};

/// Default control-transfer timeout in milliseconds
pub const DEFAULT_CONTROL_TIMEOUT_MS: u32 = 1000;

/// wLength used when fetching string descriptors
const STRING_DESCRIPTOR_LENGTH: u16 = 255;

/// Open/closed state shared between a device and its interface handles
///
/// Interface and endpoint handles may outlive a close; sharing the flag lets
/// them reject operations on a closed device without holding a reference
/// back to the device itself.
pub(crate) struct Session {
    open: AtomicBool,
}

impl Session {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub(crate) fn ensure_open(&self) -> std::result::Result<(), UsageError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(UsageError::DeviceNotOpen)
        }
    }
}

/// Payload half of a control transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlData {
    /// Device-to-host: request up to this many payload bytes
    In(usize),
    /// Host-to-device: send these payload bytes
    Out(Vec<u8>),
}

/// Summary of a device's identity and descriptor fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device class code
    pub class_code: u8,
    /// USB revision, binary-coded decimal
    pub bcd_usb: u16,
    /// Manufacturer string, when the device declares one
    pub manufacturer: Option<String>,
    /// Product string, when the device declares one
    pub product: Option<String>,
    /// Serial number string, when the device declares one
    pub serial_number: Option<String>,
}

/// One USB device visible to the host
pub struct Device {
    engine: Arc<dyn TransferEngine>,
    ident: DeviceIdent,
    descriptor: DeviceDescriptor,
    session: Arc<Session>,
    timeout_ms: AtomicU32,
    // Outer Option: not yet computed. Inner Option: computed, absent.
    config: Mutex<Option<Option<ConfigDescriptor>>>,
    all_configs: Mutex<Option<Vec<ConfigDescriptor>>>,
    bos: Mutex<Option<Option<BosDescriptor>>>,
    parent: Mutex<Option<Option<DeviceIdent>>>,
    interfaces: Mutex<Vec<Arc<Interface>>>,
}

impl Device {
    /// Build a handle for `ident`, reading its device descriptor eagerly.
    pub(crate) fn new(engine: Arc<dyn TransferEngine>, ident: DeviceIdent) -> Result<Arc<Self>> {
        let raw = engine.device_descriptor(&ident)?;
        let descriptor = DeviceDescriptor::parse(&raw)?;

        Ok(Arc::new(Self {
            engine,
            ident,
            descriptor,
            session: Session::new(),
            timeout_ms: AtomicU32::new(DEFAULT_CONTROL_TIMEOUT_MS),
            config: Mutex::new(None),
            all_configs: Mutex::new(None),
            bos: Mutex::new(None),
            parent: Mutex::new(None),
            interfaces: Mutex::new(Vec::new()),
        }))
    }

    /// Identity of this device on the bus.
    pub fn ident(&self) -> &DeviceIdent {
        &self.ident
    }

    /// Bus number.
    pub fn bus_number(&self) -> u8 {
        self.ident.bus_number
    }

    /// Device address on the bus.
    pub fn address(&self) -> u8 {
        self.ident.address
    }

    /// Port-number path from the root hub down to this device.
    pub fn port_numbers(&self) -> &[u8] {
        &self.ident.port_numbers
    }

    /// The 18-byte device descriptor, read at handle creation.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Identity of the parent hub, if any. Computed once and cached.
    ///
    /// This is identity only; it does not keep the parent alive or open.
    pub fn parent(&self) -> Option<DeviceIdent> {
        let mut cache = self.parent.lock().unwrap();
        cache
            .get_or_insert_with(|| self.engine.parent(&self.ident))
            .clone()
    }

    /// Default control-transfer timeout in milliseconds; 0 means unbounded.
    pub fn timeout(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Set the default control-transfer timeout in milliseconds.
    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Open the device and build the interface model from the active
    /// configuration.
    pub fn open(&self) -> Result<()> {
        self.engine.open_device(&self.ident)?;
        self.session.set_open(true);
        self.rebuild_interfaces()?;
        info!(device = %self.ident, "device opened");
        Ok(())
    }

    /// Close the device: release native resources, drop the interface model
    /// and the BOS cache.
    pub fn close(&self) {
        if !self.session.is_open() {
            return;
        }
        self.session.set_open(false);
        self.interfaces.lock().unwrap().clear();
        *self.bos.lock().unwrap() = None;
        self.engine.close_device(&self.ident);
        info!(device = %self.ident, "device closed");
    }

    /// The active configuration descriptor, parsed. Computed at most once.
    ///
    /// A device in the unconfigured state has no active configuration; that
    /// absence is `None`, not an error.
    pub fn config_descriptor(&self) -> Result<Option<ConfigDescriptor>> {
        let mut cache = self.config.lock().unwrap();
        if let Some(config) = cache.as_ref() {
            return Ok(config.clone());
        }

        let config = match self.engine.active_config_descriptor(&self.ident) {
            Ok(raw) => Some(ConfigDescriptor::parse(&raw)?),
            Err(TransferError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };
        *cache = Some(config.clone());
        Ok(config)
    }

    /// Every configuration descriptor the device declares. Computed at most
    /// once; a device declaring none yields an empty list.
    pub fn all_config_descriptors(&self) -> Result<Vec<ConfigDescriptor>> {
        let mut cache = self.all_configs.lock().unwrap();
        if let Some(configs) = cache.as_ref() {
            return Ok(configs.clone());
        }

        let configs = match self.engine.config_descriptors(&self.ident) {
            Ok(raws) => raws
                .iter()
                .map(|raw| ConfigDescriptor::parse(raw))
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Err(TransferError::NotFound) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        *cache = Some(configs.clone());
        Ok(configs)
    }

    /// Select a configuration by its bConfigurationValue.
    ///
    /// On success the configuration cache is invalidated and the interface
    /// model rebuilt; on failure the prior state stays untouched.
    pub fn set_configuration(&self, value: u8) -> Result<()> {
        self.session.ensure_open()?;
        self.engine.set_configuration(&self.ident, value)?;

        *self.config.lock().unwrap() = None;
        self.rebuild_interfaces()?;
        debug!(device = %self.ident, configuration = value, "configuration selected");
        Ok(())
    }

    /// Interface handles of the active configuration.
    pub fn interfaces(&self) -> Result<Vec<Arc<Interface>>> {
        self.session.ensure_open()?;
        Ok(self.interfaces.lock().unwrap().clone())
    }

    /// Look up an interface by number.
    pub fn interface(&self, number: u8) -> Result<Option<Arc<Interface>>> {
        self.session.ensure_open()?;
        Ok(self
            .interfaces
            .lock()
            .unwrap()
            .iter()
            .find(|interface| interface.number() == number)
            .cloned())
    }

    /// Perform a control transfer on endpoint zero.
    ///
    /// The data kind must match the direction bit of `request_type`: IN
    /// requests take [`ControlData::In`] and yield the received payload
    /// (bounded by what the device actually sent), OUT requests take
    /// [`ControlData::Out`] and yield an empty buffer. A mismatch or an
    /// over-long payload fails synchronously before any I/O.
    pub async fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: ControlData,
    ) -> Result<Vec<u8>> {
        self.session.ensure_open()?;

        let direction = Direction::from_request_type(request_type);
        let (length, buffer) = match (&direction, data) {
            (Direction::In, ControlData::In(len)) => {
                let length = u16::try_from(len).map_err(|_| UsageError::ControlDataTooLarge)?;
                (length, vec![0u8; SETUP_PACKET_SIZE + len])
            }
            (Direction::Out, ControlData::Out(payload)) => {
                let length =
                    u16::try_from(payload.len()).map_err(|_| UsageError::ControlDataTooLarge)?;
                let mut buffer = Vec::with_capacity(SETUP_PACKET_SIZE + payload.len());
                buffer.resize(SETUP_PACKET_SIZE, 0);
                buffer.extend_from_slice(&payload);
                (length, buffer)
            }
            _ => return Err(UsageError::ControlDirectionMismatch.into()),
        };

        let setup = SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        };
        let mut buffer = buffer;
        buffer[..SETUP_PACKET_SIZE].copy_from_slice(&setup.encode());

        let (buffer, actual) = submit_and_wait(
            &self.engine,
            &self.ident,
            0,
            TransferKind::Control,
            self.timeout(),
            buffer,
        )
        .await?;

        match direction {
            Direction::In => {
                let end = SETUP_PACKET_SIZE + actual.min(usize::from(length));
                Ok(buffer[SETUP_PACKET_SIZE..end.min(buffer.len())].to_vec())
            }
            Direction::Out => Ok(Vec::new()),
        }
    }

    /// Fetch and decode a string descriptor in US English.
    ///
    /// Index 0 is the reserved "no string" index and yields `None`.
    pub async fn string_descriptor(&self, index: u8) -> Result<Option<String>> {
        if index == 0 {
            return Ok(None);
        }

        let request_type = usb_wire::request_type(
            Direction::In,
            usb_wire::RequestKind::Standard,
            usb_wire::Recipient::Device,
        );
        let value = (u16::from(descriptor_type::STRING) << 8) | u16::from(index);
        let payload = self
            .control_transfer(
                request_type,
                standard_request::GET_DESCRIPTOR,
                value,
                LANGUAGE_ID_EN_US,
                ControlData::In(usize::from(STRING_DESCRIPTOR_LENGTH)),
            )
            .await?;

        Ok(Some(decode_string_descriptor(&payload)?))
    }

    /// The Binary Object Store descriptor, fetched once per open session.
    ///
    /// Devices below USB 2.0.1 cannot have one; for those `None` is
    /// returned without touching the bus. A STALL during either fetch phase
    /// also means "no BOS" and is cached as `None`.
    pub async fn bos_descriptor(&self) -> Result<Option<BosDescriptor>> {
        self.session.ensure_open()?;

        if let Some(bos) = self.bos.lock().unwrap().as_ref() {
            return Ok(bos.clone());
        }

        let bos = if self.descriptor.bcd_usb < BOS_MIN_BCD_USB {
            None
        } else {
            self.fetch_bos().await?
        };

        *self.bos.lock().unwrap() = Some(bos.clone());
        Ok(bos)
    }

    /// Device capability records from the BOS descriptor, or an empty list
    /// when the device has no BOS.
    pub async fn capabilities(&self) -> Result<Vec<Capability>> {
        Ok(self
            .bos_descriptor()
            .await?
            .map(|bos| bos.capabilities)
            .unwrap_or_default())
    }

    /// Perform a port reset on the device.
    pub fn reset(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.engine.reset_device(&self.ident)?;
        Ok(())
    }

    /// Summarize the device's identity, resolving its descriptor strings.
    pub async fn info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            bus_number: self.ident.bus_number,
            address: self.ident.address,
            vendor_id: self.descriptor.vendor_id,
            product_id: self.descriptor.product_id,
            class_code: self.descriptor.class_code,
            bcd_usb: self.descriptor.bcd_usb,
            manufacturer: self
                .string_descriptor(self.descriptor.manufacturer_index)
                .await?,
            product: self.string_descriptor(self.descriptor.product_index).await?,
            serial_number: self
                .string_descriptor(self.descriptor.serial_number_index)
                .await?,
        })
    }

    /// Two-phase BOS fetch: 5-byte header probe, then the full block at the
    /// advertised wTotalLength.
    async fn fetch_bos(&self) -> Result<Option<BosDescriptor>> {
        let request_type = usb_wire::request_type(
            Direction::In,
            usb_wire::RequestKind::Standard,
            usb_wire::Recipient::Device,
        );
        let value = u16::from(descriptor_type::BOS) << 8;

        let header = match self
            .control_transfer(
                request_type,
                standard_request::GET_DESCRIPTOR,
                value,
                0,
                ControlData::In(BOS_HEADER_SIZE),
            )
            .await
        {
            Ok(header) => header,
            Err(crate::error::Error::Transfer(TransferError::Pipe)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let total_length = usize::from(read_total_length(&header)?);

        let body = match self
            .control_transfer(
                request_type,
                standard_request::GET_DESCRIPTOR,
                value,
                0,
                ControlData::In(total_length),
            )
            .await
        {
            Ok(body) => body,
            Err(crate::error::Error::Transfer(TransferError::Pipe)) => return Ok(None),
            Err(err) => return Err(err),
        };

        Ok(Some(BosDescriptor::parse(&body)?))
    }

    /// Rebuild the interface model from the active configuration.
    fn rebuild_interfaces(&self) -> Result<()> {
        let interfaces = match self.config_descriptor()? {
            Some(config) => config
                .interfaces
                .iter()
                .map(|group| {
                    Arc::new(Interface::new(
                        Arc::clone(&self.engine),
                        self.ident.clone(),
                        Arc::clone(&self.session),
                        group.clone(),
                    ))
                })
                .collect(),
            None => Vec::new(),
        };
        *self.interfaces.lock().unwrap() = interfaces;
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("ident", &self.ident)
            .field(
                "vendor_product",
                &format_args!(
                    "{:04x}:{:04x}",
                    self.descriptor.vendor_id, self.descriptor.product_id
                ),
            )
            .field("open", &self.is_open())
            .finish()
    }
}
