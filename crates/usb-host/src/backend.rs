//! rusb-backed transfer engine
//!
//! Bridges the engine boundary onto rusb's synchronous API. Blocking
//! transfer execution and the libusb event loop both live on a dedicated
//! `usb-worker` OS thread, fed over an async-channel command queue;
//! completions are invoked from that thread.
//!
//! Two rusb limitations shape this engine: synchronous transfers cannot be
//! cancelled (so `cancel_transfer` reports false and transfers settle at
//! their timeouts), and isochronous endpoints are not supported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::UsbContext;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::{
    Completion, CompletionFn, DeviceIdent, EngineResult, HotplugEvent, TransferEngine,
    TransferHandle,
};
use crate::error::TransferError;
use usb_wire::{Direction, SETUP_PACKET_SIZE, SetupPacket, TransferKind};

/// Poll interval of the worker's libusb event loop
const EVENT_LOOP_TIMEOUT: Duration = Duration::from_millis(100);

enum WorkerCommand {
    Execute(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

struct EngineInner {
    handles: HashMap<DeviceIdent, Arc<rusb::DeviceHandle<rusb::Context>>>,
    hotplug: Option<rusb::Registration<rusb::Context>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

/// Transfer engine over rusb
pub struct RusbEngine {
    context: rusb::Context,
    commands: async_channel::Sender<WorkerCommand>,
    next_handle: AtomicU64,
    inner: Mutex<EngineInner>,
}

impl RusbEngine {
    /// Create the engine and spawn its worker thread.
    pub fn new() -> EngineResult<Self> {
        let context = rusb::Context::new().map_err(map_rusb_error)?;
        let (commands, command_rx) = async_channel::unbounded::<WorkerCommand>();

        let worker_context = context.clone();
        let worker = std::thread::Builder::new()
            .name("usb-worker".to_string())
            .spawn(move || run_worker(worker_context, command_rx))
            .map_err(|e| TransferError::Other(format!("failed to spawn usb worker: {}", e)))?;

        Ok(Self {
            context,
            commands,
            next_handle: AtomicU64::new(1),
            inner: Mutex::new(EngineInner {
                handles: HashMap::new(),
                hotplug: None,
                worker: Some(worker),
            }),
        })
    }

    fn find_device(&self, ident: &DeviceIdent) -> EngineResult<rusb::Device<rusb::Context>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|device| &device_ident(device) == ident)
            .ok_or(TransferError::NoDevice)
    }

    fn handle(&self, ident: &DeviceIdent) -> EngineResult<Arc<rusb::DeviceHandle<rusb::Context>>> {
        self.inner
            .lock()
            .unwrap()
            .handles
            .get(ident)
            .cloned()
            .ok_or(TransferError::NotFound)
    }
}

impl TransferEngine for RusbEngine {
    fn list_devices(&self) -> EngineResult<Vec<DeviceIdent>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        Ok(devices.iter().map(|device| device_ident(&device)).collect())
    }

    fn device_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>> {
        let device = self.find_device(device)?;
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        Ok(encode_device_descriptor(&descriptor))
    }

    fn parent(&self, device: &DeviceIdent) -> Option<DeviceIdent> {
        let device = self.find_device(device).ok()?;
        device.get_parent().map(|parent| device_ident(&parent))
    }

    fn open_device(&self, device: &DeviceIdent) -> EngineResult<()> {
        let native = self.find_device(device)?;
        let handle = native.open().map_err(map_rusb_error)?;
        self.inner
            .lock()
            .unwrap()
            .handles
            .insert(device.clone(), Arc::new(handle));
        debug!(device = %device, "rusb device opened");
        Ok(())
    }

    fn close_device(&self, device: &DeviceIdent) {
        // Dropping the last Arc closes the native handle; in-flight worker
        // closures keep theirs alive until their transfers settle.
        self.inner.lock().unwrap().handles.remove(device);
        debug!(device = %device, "rusb device closed");
    }

    fn active_config_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>> {
        let device = self.find_device(device)?;
        let config = device.active_config_descriptor().map_err(map_rusb_error)?;
        Ok(encode_config_descriptor(&config))
    }

    fn config_descriptors(&self, device: &DeviceIdent) -> EngineResult<Vec<Vec<u8>>> {
        let device = self.find_device(device)?;
        let count = device
            .device_descriptor()
            .map_err(map_rusb_error)?
            .num_configurations();
        let mut configs = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let config = device.config_descriptor(index).map_err(map_rusb_error)?;
            configs.push(encode_config_descriptor(&config));
        }
        Ok(configs)
    }

    fn set_configuration(&self, device: &DeviceIdent, value: u8) -> EngineResult<()> {
        self.handle(device)?
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.handle(device)?
            .claim_interface(number)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.handle(device)?
            .release_interface(number)
            .map_err(map_rusb_error)
    }

    fn set_alt_setting(&self, device: &DeviceIdent, number: u8, alt: u8) -> EngineResult<()> {
        self.handle(device)?
            .set_alternate_setting(number, alt)
            .map_err(map_rusb_error)
    }

    fn kernel_driver_active(&self, device: &DeviceIdent, number: u8) -> EngineResult<bool> {
        self.handle(device)?
            .kernel_driver_active(number)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.handle(device)?
            .detach_kernel_driver(number)
            .map_err(map_rusb_error)
    }

    fn attach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()> {
        self.handle(device)?
            .attach_kernel_driver(number)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, device: &DeviceIdent, endpoint: u8) -> EngineResult<()> {
        self.handle(device)?
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn reset_device(&self, device: &DeviceIdent) -> EngineResult<()> {
        self.handle(device)?.reset().map_err(map_rusb_error)
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
        if kind == TransferKind::Isochronous {
            return Err(TransferError::NotSupported);
        }

        let handle = self.handle(device)?;
        let transfer = TransferHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let timeout = Duration::from_millis(u64::from(timeout_ms));

        let job = Box::new(move || {
            let completion = execute_transfer(&handle, endpoint, kind, timeout, buffer);
            on_complete(completion);
        });

        self.commands
            .try_send(WorkerCommand::Execute(job))
            .map_err(|_| TransferError::Other("usb worker unavailable".into()))?;
        Ok(transfer)
    }

    fn cancel_transfer(&self, _handle: TransferHandle) -> bool {
        // Synchronous rusb transfers cannot be interrupted; they settle at
        // their timeout instead.
        false
    }

    fn enable_hotplug(&self, sink: broadcast::Sender<HotplugEvent>) -> EngineResult<()> {
        if !rusb::has_hotplug() {
            return Err(TransferError::NotSupported);
        }

        let registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { sink }))
            .map_err(map_rusb_error)?;

        self.inner.lock().unwrap().hotplug = Some(registration);
        info!("rusb hotplug notifications registered");
        Ok(())
    }

    fn disable_hotplug(&self) {
        // Dropping the registration unregisters the callback.
        self.inner.lock().unwrap().hotplug = None;
        info!("rusb hotplug notifications unregistered");
    }
}

impl Drop for RusbEngine {
    fn drop(&mut self) {
        let _ = self.commands.try_send(WorkerCommand::Shutdown);
        if let Some(worker) = self.inner.lock().unwrap().worker.take() {
            let _ = worker.join();
        }
    }
}

struct HotplugForwarder {
    sink: broadcast::Sender<HotplugEvent>,
}

impl rusb::Hotplug<rusb::Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        let _ = self.sink.send(HotplugEvent::Attached(device_ident(&device)));
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        let _ = self.sink.send(HotplugEvent::Detached(device_ident(&device)));
    }
}

/// Worker thread body: execute queued transfer jobs and pump the libusb
/// event loop so hotplug callbacks fire.
fn run_worker(context: rusb::Context, commands: async_channel::Receiver<WorkerCommand>) {
    info!("usb worker thread started");

    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Execute(job)) => job(),
            Ok(WorkerCommand::Shutdown) | Err(async_channel::TryRecvError::Closed) => break,
            Err(async_channel::TryRecvError::Empty) => {}
        }

        match context.handle_events(Some(EVENT_LOOP_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("usb event handling interrupted");
            }
            Err(e) => {
                warn!("error handling usb events: {}", e);
                std::thread::sleep(EVENT_LOOP_TIMEOUT);
            }
        }
    }

    info!("usb worker thread stopped");
}

/// Execute one blocking transfer and package the outcome.
fn execute_transfer(
    handle: &rusb::DeviceHandle<rusb::Context>,
    endpoint: u8,
    kind: TransferKind,
    timeout: Duration,
    mut buffer: Vec<u8>,
) -> Completion {
    let result = match kind {
        TransferKind::Control => execute_control(handle, timeout, &mut buffer),
        TransferKind::Bulk => match Direction::from_address(endpoint) {
            Direction::In => handle.read_bulk(endpoint, &mut buffer, timeout),
            Direction::Out => handle.write_bulk(endpoint, &buffer, timeout),
        }
        .map_err(map_rusb_error),
        TransferKind::Interrupt => match Direction::from_address(endpoint) {
            Direction::In => handle.read_interrupt(endpoint, &mut buffer, timeout),
            Direction::Out => handle.write_interrupt(endpoint, &buffer, timeout),
        }
        .map_err(map_rusb_error),
        TransferKind::Isochronous => Err(TransferError::NotSupported),
    };

    match result {
        Ok(actual_length) => Completion {
            status: Ok(()),
            buffer,
            actual_length,
        },
        Err(err) => Completion {
            status: Err(err),
            buffer,
            actual_length: 0,
        },
    }
}

/// Control transfers carry their 8-byte setup packet at the front of the
/// buffer; the payload follows.
fn execute_control(
    handle: &rusb::DeviceHandle<rusb::Context>,
    timeout: Duration,
    buffer: &mut [u8],
) -> Result<usize, TransferError> {
    let setup = SetupPacket::decode(buffer).map_err(|_| TransferError::InvalidParam)?;
    let payload = &mut buffer[SETUP_PACKET_SIZE..];

    match setup.direction() {
        Direction::In => handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                payload,
                timeout,
            )
            .map_err(map_rusb_error),
        Direction::Out => handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                payload,
                timeout,
            )
            .map_err(map_rusb_error),
    }
}

fn device_ident(device: &rusb::Device<rusb::Context>) -> DeviceIdent {
    DeviceIdent {
        bus_number: device.bus_number(),
        address: device.address(),
        port_numbers: device.port_numbers().unwrap_or_default(),
    }
}

fn version_to_bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Re-encode rusb's parsed device descriptor into its raw 18-byte layout.
fn encode_device_descriptor(descriptor: &rusb::DeviceDescriptor) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(usb_wire::DEVICE_DESCRIPTOR_SIZE);
    bytes.push(usb_wire::DEVICE_DESCRIPTOR_SIZE as u8);
    bytes.push(usb_wire::descriptor_type::DEVICE);
    bytes.extend_from_slice(&version_to_bcd(descriptor.usb_version()).to_le_bytes());
    bytes.push(descriptor.class_code());
    bytes.push(descriptor.sub_class_code());
    bytes.push(descriptor.protocol_code());
    bytes.push(descriptor.max_packet_size());
    bytes.extend_from_slice(&descriptor.vendor_id().to_le_bytes());
    bytes.extend_from_slice(&descriptor.product_id().to_le_bytes());
    bytes.extend_from_slice(&version_to_bcd(descriptor.device_version()).to_le_bytes());
    bytes.push(descriptor.manufacturer_string_index().unwrap_or(0));
    bytes.push(descriptor.product_string_index().unwrap_or(0));
    bytes.push(descriptor.serial_number_string_index().unwrap_or(0));
    bytes.push(descriptor.num_configurations());
    bytes
}

/// Re-encode rusb's parsed configuration tree into a raw configuration
/// block (class-specific descriptors are appended from the extra bytes).
fn encode_config_descriptor(config: &rusb::ConfigDescriptor) -> Vec<u8> {
    let mut body = Vec::new();

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            body.extend_from_slice(&[
                0x09,
                usb_wire::descriptor_type::INTERFACE,
                descriptor.interface_number(),
                descriptor.setting_number(),
                descriptor.num_endpoints(),
                descriptor.class_code(),
                descriptor.sub_class_code(),
                descriptor.protocol_code(),
                descriptor.description_string_index().unwrap_or(0),
            ]);
            body.extend_from_slice(descriptor.extra());

            for endpoint in descriptor.endpoint_descriptors() {
                let attributes = endpoint_attributes(&endpoint);
                body.extend_from_slice(&[
                    0x07,
                    usb_wire::descriptor_type::ENDPOINT,
                    endpoint.address(),
                    attributes,
                ]);
                body.extend_from_slice(&endpoint.max_packet_size().to_le_bytes());
                body.push(endpoint.interval());
                body.extend_from_slice(endpoint.extra().unwrap_or(&[]));
            }
        }
    }

    let total = 9 + body.len();
    let mut attributes = 0x80u8;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    let mut bytes = vec![
        0x09,
        usb_wire::descriptor_type::CONFIGURATION,
    ];
    bytes.extend_from_slice(&(total as u16).to_le_bytes());
    bytes.push(config.interfaces().count() as u8);
    bytes.push(config.number());
    bytes.push(config.description_string_index().unwrap_or(0));
    bytes.push(attributes);
    bytes.push((config.max_power() / 2) as u8);
    bytes.extend_from_slice(&body);
    bytes
}

fn endpoint_attributes(endpoint: &rusb::EndpointDescriptor<'_>) -> u8 {
    let transfer = match endpoint.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match endpoint.sync_type() {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match endpoint.usage_type() {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | (sync << 2) | (usage << 4)
}

/// Map rusb errors onto the engine's transport error codes.
fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Io => TransferError::Io,
        rusb::Error::InvalidParam => TransferError::InvalidParam,
        rusb::Error::Access => TransferError::Access,
        rusb::Error::NoDevice => TransferError::NoDevice,
        rusb::Error::NotFound => TransferError::NotFound,
        rusb::Error::Busy => TransferError::Busy,
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Pipe => TransferError::Pipe,
        rusb::Error::Interrupted => TransferError::Interrupted,
        rusb::Error::NoMem => TransferError::NoMem,
        rusb::Error::NotSupported => TransferError::NotSupported,
        rusb::Error::BadDescriptor | rusb::Error::Other => TransferError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferError::Pipe);
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            TransferError::NoDevice
        );
        assert_eq!(
            map_rusb_error(rusb::Error::NotFound),
            TransferError::NotFound
        );
    }

    #[test]
    fn test_version_to_bcd() {
        assert_eq!(version_to_bcd(rusb::Version(2, 1, 0)), 0x0210);
        assert_eq!(version_to_bcd(rusb::Version(2, 0, 0)), 0x0200);
    }
}
