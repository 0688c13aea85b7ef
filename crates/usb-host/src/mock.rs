//! Scriptable in-memory transfer engine for tests
//!
//! [`MockEngine`] implements the engine boundary over a table of fake
//! devices built from raw descriptor bytes. Control transfers answer from a
//! scripted FIFO and complete inline; bulk and interrupt transfers queue up
//! until the test completes them by hand, which makes in-flight counts and
//! drain ordering observable. Every submission is logged.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::{
    Completion, CompletionFn, DeviceIdent, EngineResult, HotplugEvent, TransferEngine,
    TransferHandle,
};
use crate::error::TransferError;
use usb_wire::{SETUP_PACKET_SIZE, TransferKind};

/// One fake device in the mock's table
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Identity reported to the model
    pub ident: DeviceIdent,
    /// Raw 18-byte device descriptor
    pub device_descriptor: Vec<u8>,
    /// Raw active configuration block, if the device is configured
    pub active_config: Option<Vec<u8>>,
    /// Raw blocks of every declared configuration; an empty list reads back
    /// as absent, the way an unconfigured device reports it
    pub configs: Vec<Vec<u8>>,
    /// Identity of the parent hub
    pub parent: Option<DeviceIdent>,
}

impl MockDevice {
    /// A device at `bus:address` with the given descriptor and one active
    /// configuration.
    pub fn new(bus_number: u8, address: u8, device_descriptor: Vec<u8>) -> Self {
        Self {
            ident: DeviceIdent {
                bus_number,
                address,
                port_numbers: vec![address],
            },
            device_descriptor,
            active_config: None,
            configs: Vec::new(),
            parent: None,
        }
    }

    /// Attach a configuration block; the first one becomes active.
    pub fn with_config(mut self, config: Vec<u8>) -> Self {
        if self.active_config.is_none() {
            self.active_config = Some(config.clone());
        }
        self.configs.push(config);
        self
    }
}

/// Record of one `submit_transfer` call
#[derive(Debug, Clone)]
pub struct Submission {
    /// Handle returned to the submitter
    pub handle: TransferHandle,
    /// Target device
    pub device: DeviceIdent,
    /// Endpoint address
    pub endpoint: u8,
    /// Transfer kind
    pub kind: TransferKind,
    /// Timeout in milliseconds
    pub timeout_ms: u32,
    /// Full buffer as submitted (setup prefix included for control)
    pub buffer: Vec<u8>,
}

struct PendingTransfer {
    handle: TransferHandle,
    buffer: Vec<u8>,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct MockInner {
    devices: Vec<MockDevice>,
    open: HashSet<DeviceIdent>,
    claimed: HashSet<(DeviceIdent, u8)>,
    kernel_driver: HashMap<(DeviceIdent, u8), bool>,
    alt_settings: Vec<(u8, u8)>,
    cleared_halts: Vec<u8>,
    resets: usize,
    active_config_reads: usize,
    config_list_reads: usize,
    control_script: VecDeque<EngineResult<Vec<u8>>>,
    fail_next_submit: Option<TransferError>,
    pending: VecDeque<PendingTransfer>,
    submissions: Vec<Submission>,
    cancelled: HashSet<TransferHandle>,
    accept_cancel: bool,
    next_handle: u64,
    hotplug: Option<broadcast::Sender<HotplugEvent>>,
    hotplug_enables: usize,
    hotplug_disables: usize,
}

/// Scriptable transfer engine
pub struct MockEngine {
    inner: Mutex<MockInner>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                accept_cancel: true,
                next_handle: 1,
                ..MockInner::default()
            }),
        }
    }

    /// Add a fake device to the bus table.
    pub fn add_device(&self, device: MockDevice) {
        self.inner.lock().unwrap().devices.push(device);
    }

    /// Queue the outcome of the next control transfer.
    ///
    /// `Ok(payload)` answers an IN request with those bytes (or acknowledges
    /// an OUT request); `Err` fails the transfer on its completion path.
    pub fn script_control(&self, outcome: EngineResult<Vec<u8>>) {
        self.inner.lock().unwrap().control_script.push_back(outcome);
    }

    /// Make the next `submit_transfer` call fail synchronously.
    pub fn fail_next_submit(&self, err: TransferError) {
        self.inner.lock().unwrap().fail_next_submit = Some(err);
    }

    /// Whether `cancel_transfer` reports success (default true).
    pub fn set_accept_cancel(&self, accept: bool) {
        self.inner.lock().unwrap().accept_cancel = accept;
    }

    /// Number of bulk/interrupt transfers currently awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Complete the oldest pending transfer with `status` and `data`.
    ///
    /// Panics when nothing is pending; tests drive completions explicitly.
    pub fn complete_next(&self, status: EngineResult<()>, data: &[u8]) {
        let pending = self
            .inner
            .lock()
            .unwrap()
            .pending
            .pop_front()
            .expect("no pending transfer to complete");

        let mut buffer = pending.buffer;
        let actual = data.len().min(buffer.len());
        buffer[..actual].copy_from_slice(&data[..actual]);
        // Callback runs outside the lock; it may resubmit into this engine.
        (pending.on_complete)(Completion {
            status,
            buffer,
            actual_length: actual,
        });
    }

    /// Deliver a `Cancelled` completion for every transfer whose handle was
    /// marked by `cancel_transfer`.
    pub fn complete_cancelled(&self) {
        let cancelled: Vec<PendingTransfer> = {
            let mut inner = self.inner.lock().unwrap();
            let handles = inner.cancelled.clone();
            let mut taken = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(pending) = inner.pending.pop_front() {
                if handles.contains(&pending.handle) {
                    taken.push(pending);
                } else {
                    keep.push_back(pending);
                }
            }
            inner.pending = keep;
            taken
        };

        for pending in cancelled {
            (pending.on_complete)(Completion {
                status: Err(TransferError::Cancelled),
                buffer: pending.buffer,
                actual_length: 0,
            });
        }
    }

    /// Every submission made so far, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.inner.lock().unwrap().submissions.clone()
    }

    /// How many times the active configuration block was read.
    pub fn active_config_reads(&self) -> usize {
        self.inner.lock().unwrap().active_config_reads
    }

    /// How many times the full configuration list was read.
    pub fn config_list_reads(&self) -> usize {
        self.inner.lock().unwrap().config_list_reads
    }

    /// Alternate settings activated so far, as (interface, alt) pairs.
    pub fn alt_settings_activated(&self) -> Vec<(u8, u8)> {
        self.inner.lock().unwrap().alt_settings.clone()
    }

    /// Endpoints on which halts were cleared.
    pub fn cleared_halts(&self) -> Vec<u8> {
        self.inner.lock().unwrap().cleared_halts.clone()
    }

    /// Whether the device is currently held open.
    pub fn is_open(&self, device: &DeviceIdent) -> bool {
        self.inner.lock().unwrap().open.contains(device)
    }

    /// How many port resets were performed.
    pub fn resets(&self) -> usize {
        self.inner.lock().unwrap().resets
    }

    /// Whether `(device, interface)` is currently claimed.
    pub fn is_claimed(&self, device: &DeviceIdent, number: u8) -> bool {
        self.inner
            .lock()
            .unwrap()
            .claimed
            .contains(&(device.clone(), number))
    }

    /// Pretend a kernel driver is bound to `(device, interface)`.
    pub fn set_kernel_driver(&self, device: &DeviceIdent, number: u8, active: bool) {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver
            .insert((device.clone(), number), active);
    }

    /// Push a hotplug event into the enabled notification channel.
    pub fn inject_hotplug(&self, event: HotplugEvent) {
        let sender = self.inner.lock().unwrap().hotplug.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    /// Whether notifications are currently enabled.
    pub fn hotplug_enabled(&self) -> bool {
        self.inner.lock().unwrap().hotplug.is_some()
    }

    /// How many times notifications were enabled / disabled.
    pub fn hotplug_transitions(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.hotplug_enables, inner.hotplug_disables)
    }

    fn with_device<T>(
        &self,
        ident: &DeviceIdent,
        f: impl FnOnce(&MockDevice) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let inner = self.inner.lock().unwrap();
        match inner.devices.iter().find(|device| &device.ident == ident) {
            Some(device) => f(device),
            None => Err(TransferError::NoDevice),
        }
    }
}

impl TransferEngine for MockEngine {
    fn list_devices(&self) -> EngineResult<Vec<DeviceIdent>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .devices
            .iter()
            .map(|device| device.ident.clone())
            .collect())
    }

    fn device_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>> {
        self.with_device(device, |device| Ok(device.device_descriptor.clone()))
    }

    fn parent(&self, device: &DeviceIdent) -> Option<DeviceIdent> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .iter()
            .find(|entry| &entry.ident == device)
            .and_then(|entry| entry.parent.clone())
    }

    fn open_device(&self, device: &DeviceIdent) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.devices.iter().any(|entry| &entry.ident == device) {
            return Err(TransferError::NoDevice);
        }
        inner.open.insert(device.clone());
        Ok(())
    }

    fn close_device(&self, device: &DeviceIdent) {
        self.inner.lock().unwrap().open.remove(device);
    }

    fn active_config_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        inner.active_config_reads += 1;
        match inner.devices.iter().find(|entry| &entry.ident == device) {
            Some(entry) => entry
                .active_config
                .clone()
                .ok_or(TransferError::NotFound),
            None => Err(TransferError::NoDevice),
        }
    }

    fn config_descriptors(&self, device: &DeviceIdent) -> EngineResult<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        inner.config_list_reads += 1;
        match inner.devices.iter().find(|entry| &entry.ident == device) {
            Some(entry) if entry.configs.is_empty() => Err(TransferError::NotFound),
            Some(entry) => Ok(entry.configs.clone()),
            None => Err(TransferError::NoDevice),
        }
    }

    fn set_configuration(&self, device: &DeviceIdent, value: u8) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner
            .devices
            .iter_mut()
            .find(|entry| &entry.ident == device)
        else {
            return Err(TransferError::NoDevice);
        };
        // bConfigurationValue lives at byte 5 of the configuration block.
        match entry
            .configs
            .iter()
            .find(|config| config.get(5) == Some(&value))
        {
            Some(config) => {
                entry.active_config = Some(config.clone());
                Ok(())
            }
            None => Err(TransferError::NotFound),
        }
    }

    fn claim_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.inner
            .lock()
            .unwrap()
            .claimed
            .insert((device.clone(), number));
        Ok(())
    }

    fn release_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.inner
            .lock()
            .unwrap()
            .claimed
            .remove(&(device.clone(), number));
        Ok(())
    }

    fn set_alt_setting(&self, _device: &DeviceIdent, number: u8, alt: u8) -> EngineResult<()> {
        self.inner.lock().unwrap().alt_settings.push((number, alt));
        Ok(())
    }

    fn kernel_driver_active(&self, device: &DeviceIdent, number: u8) -> EngineResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .kernel_driver
            .get(&(device.clone(), number))
            .copied()
            .unwrap_or(false))
    }

    fn detach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver
            .insert((device.clone(), number), false);
        Ok(())
    }

    fn attach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.inner
            .lock()
            .unwrap()
            .kernel_driver
            .insert((device.clone(), number), true);
        Ok(())
    }

    fn clear_halt(&self, _device: &DeviceIdent, endpoint: u8) -> EngineResult<()> {
        self.inner.lock().unwrap().cleared_halts.push(endpoint);
        Ok(())
    }

    fn reset_device(&self, _device: &DeviceIdent) -> EngineResult<()> {
        self.inner.lock().unwrap().resets += 1;
        Ok(())
    }

    fn submit_transfer(
        &self,
        device: &DeviceIdent,
        endpoint: u8,
        kind: TransferKind,
        timeout_ms: u32,
        buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> EngineResult<TransferHandle> {
        let (handle, control_outcome) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(err) = inner.fail_next_submit.take() {
                return Err(err);
            }
            // A control buffer must at least hold the setup packet.
            if kind == TransferKind::Control && buffer.len() < SETUP_PACKET_SIZE {
                return Err(TransferError::InvalidParam);
            }

            let handle = TransferHandle(inner.next_handle);
            inner.next_handle += 1;
            inner.submissions.push(Submission {
                handle,
                device: device.clone(),
                endpoint,
                kind,
                timeout_ms,
                buffer: buffer.clone(),
            });
            trace!(?handle, endpoint, ?kind, "mock transfer submitted");

            if kind == TransferKind::Control {
                let outcome = inner
                    .control_script
                    .pop_front()
                    .unwrap_or(Err(TransferError::Other("unscripted control transfer".into())));
                (handle, Some(outcome))
            } else {
                inner.pending.push_back(PendingTransfer {
                    handle,
                    buffer,
                    on_complete,
                });
                return Ok(handle);
            }
        };

        // Control transfers complete inline, outside the lock.
        if let Some(outcome) = control_outcome {
            let completion = match outcome {
                Ok(payload) => {
                    let mut buffer = buffer;
                    let end = (SETUP_PACKET_SIZE + payload.len()).min(buffer.len());
                    let copied = end.saturating_sub(SETUP_PACKET_SIZE);
                    buffer[SETUP_PACKET_SIZE..end].copy_from_slice(&payload[..copied]);
                    Completion {
                        status: Ok(()),
                        buffer,
                        actual_length: copied,
                    }
                }
                Err(err) => Completion {
                    status: Err(err),
                    buffer,
                    actual_length: 0,
                },
            };
            on_complete(completion);
        }
        Ok(handle)
    }

    fn cancel_transfer(&self, handle: TransferHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accept_cancel {
            return false;
        }
        let pending = inner
            .pending
            .iter()
            .any(|transfer| transfer.handle == handle);
        if pending {
            inner.cancelled.insert(handle);
        }
        pending
    }

    fn enable_hotplug(&self, sink: broadcast::Sender<HotplugEvent>) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.hotplug = Some(sink);
        inner.hotplug_enables += 1;
        Ok(())
    }

    fn disable_hotplug(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.hotplug = None;
        inner.hotplug_disables += 1;
    }
}

/// Raw 18-byte device descriptor for a full-speed USB 2.0 device.
pub fn build_device_descriptor(vendor_id: u16, product_id: u16, bcd_usb: u16) -> Vec<u8> {
    let mut bytes = vec![
        0x12, 0x01, 0, 0, // bcdUSB filled below
        0x00, 0x00, 0x00, 0x40,
        0, 0, 0, 0, // idVendor / idProduct filled below
        0x00, 0x01, // bcdDevice 1.00
        0x01, 0x02, 0x03, // string indexes
        0x01, // bNumConfigurations
    ];
    bytes[2..4].copy_from_slice(&bcd_usb.to_le_bytes());
    bytes[8..10].copy_from_slice(&vendor_id.to_le_bytes());
    bytes[10..12].copy_from_slice(&product_id.to_le_bytes());
    bytes
}

/// Endpoint declaration for [`build_config_descriptor`]
#[derive(Debug, Clone, Copy)]
pub struct EndpointSpec {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// bmAttributes (transfer type in the low two bits)
    pub attributes: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
}

/// Alternate-setting declaration for [`build_config_descriptor`]
#[derive(Debug, Clone)]
pub struct AltSpec {
    /// Alternate setting value
    pub alt: u8,
    /// Endpoints under this setting
    pub endpoints: Vec<EndpointSpec>,
}

/// Raw configuration block with one interface and the given alternate
/// settings.
pub fn build_config_descriptor(value: u8, interface: u8, alts: &[AltSpec]) -> Vec<u8> {
    let mut body = Vec::new();
    for alt in alts {
        body.extend_from_slice(&[
            0x09,
            0x04,
            interface,
            alt.alt,
            alt.endpoints.len() as u8,
            0xff,
            0x00,
            0x00,
            0x00,
        ]);
        for endpoint in &alt.endpoints {
            let mut record = vec![0x07, 0x05, endpoint.address, endpoint.attributes];
            record.extend_from_slice(&endpoint.max_packet_size.to_le_bytes());
            record.push(0x00);
            body.extend_from_slice(&record);
        }
    }

    let total = 9 + body.len();
    let mut bytes = vec![0x09, 0x02, 0, 0, 0x01, value, 0x00, 0x80, 0x32];
    bytes[2..4].copy_from_slice(&(total as u16).to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_descriptors_parse() {
        let device = usb_wire::DeviceDescriptor::parse(&build_device_descriptor(
            0x1234, 0x5678, 0x0210,
        ))
        .unwrap();
        assert_eq!(device.vendor_id, 0x1234);
        assert_eq!(device.bcd_usb, 0x0210);

        let config = usb_wire::ConfigDescriptor::parse(&build_config_descriptor(
            1,
            0,
            &[AltSpec {
                alt: 0,
                endpoints: vec![EndpointSpec {
                    address: 0x81,
                    attributes: 0x02,
                    max_packet_size: 64,
                }],
            }],
        ))
        .unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].alt_settings[0].endpoints.len(), 1);
    }

    #[test]
    fn test_scripted_control_completes_inline() {
        let engine = MockEngine::new();
        let ident = DeviceIdent {
            bus_number: 1,
            address: 1,
            port_numbers: vec![1],
        };
        engine.add_device(MockDevice::new(
            1,
            1,
            build_device_descriptor(0x1234, 0x5678, 0x0200),
        ));
        engine.script_control(Ok(vec![0xaa, 0xbb]));

        let completed = std::sync::Arc::new(Mutex::new(None));
        let sink = std::sync::Arc::clone(&completed);
        engine
            .submit_transfer(
                &ident,
                0,
                TransferKind::Control,
                1000,
                vec![0u8; SETUP_PACKET_SIZE + 4],
                Box::new(move |completion| {
                    *sink.lock().unwrap() = Some(completion);
                }),
            )
            .unwrap();

        let completion = completed.lock().unwrap().take().unwrap();
        assert!(completion.status.is_ok());
        assert_eq!(completion.actual_length, 2);
        assert_eq!(
            &completion.buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + 2],
            &[0xaa, 0xbb]
        );
    }

    #[test]
    fn test_control_buffer_without_setup_room_rejected() {
        let engine = MockEngine::new();
        let ident = DeviceIdent {
            bus_number: 1,
            address: 1,
            port_numbers: vec![1],
        };
        engine.add_device(MockDevice::new(
            1,
            1,
            build_device_descriptor(0x1234, 0x5678, 0x0200),
        ));
        engine.script_control(Ok(vec![0xaa]));

        let result = engine.submit_transfer(
            &ident,
            0,
            TransferKind::Control,
            1000,
            vec![0u8; SETUP_PACKET_SIZE - 1],
            Box::new(|_| panic!("rejected submission must not complete")),
        );
        assert!(matches!(result, Err(TransferError::InvalidParam)));
        assert!(engine.submissions().is_empty());
    }

    #[test]
    fn test_pending_fifo_and_cancel_marking() {
        let engine = MockEngine::new();
        let ident = DeviceIdent {
            bus_number: 1,
            address: 2,
            port_numbers: vec![2],
        };

        let handle = engine
            .submit_transfer(
                &ident,
                0x81,
                TransferKind::Bulk,
                0,
                vec![0u8; 64],
                Box::new(|_| {}),
            )
            .unwrap();
        assert_eq!(engine.in_flight(), 1);

        assert!(engine.cancel_transfer(handle));
        // Cancellation marks the transfer; it still settles explicitly.
        assert_eq!(engine.in_flight(), 1);
        engine.complete_cancelled();
        assert_eq!(engine.in_flight(), 0);
    }
}
