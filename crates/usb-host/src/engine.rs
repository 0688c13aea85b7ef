//! Transfer engine boundary
//!
//! The host model is built on top of a native transfer engine that performs
//! wire-level I/O and delivers completions asynchronously from its own
//! event-processing context. [`TransferEngine`] is that boundary: everything
//! above it (devices, interfaces, endpoints, streaming pools) is engine
//! agnostic, and tests drive the model through a scripted mock.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TransferError;
use usb_wire::TransferKind;

/// Result type at the engine boundary
pub type EngineResult<T> = std::result::Result<T, TransferError>;

/// Identity of a device slot as reported by the transfer engine
///
/// Stable for as long as the device stays connected. This is identity, not
/// ownership: holding an ident does not keep any native resource alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdent {
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
    /// Port-number path from the root hub down to the device
    pub port_numbers: Vec<u8>,
}

impl std::fmt::Display for DeviceIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus {} addr {}", self.bus_number, self.address)
    }
}

/// Opaque handle to one submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(pub u64);

/// Final outcome of one submitted transfer
///
/// Every submitted transfer terminates exactly once, either with a success
/// status and an actual length, or with a [`TransferError`]. The buffer is
/// returned to the caller in both cases.
#[derive(Debug)]
pub struct Completion {
    /// Success or transport error code
    pub status: EngineResult<()>,
    /// The transfer buffer, back from the engine
    pub buffer: Vec<u8>,
    /// Bytes actually transferred (payload bytes for control transfers)
    pub actual_length: usize,
}

/// Completion callback for one submitted transfer
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Device arrival/departure notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotplugEvent {
    /// A device appeared on the bus
    Attached(DeviceIdent),
    /// A device left the bus
    Detached(DeviceIdent),
}

/// The native transfer engine contract
///
/// Implementations must deliver every completion exactly once. Completions
/// may be invoked synchronously from within `submit_transfer` (an engine
/// that can answer immediately is allowed to), but never from within
/// `cancel_transfer`; a cancelled transfer still settles through its normal
/// completion delivery.
///
/// Descriptor queries return raw descriptor bytes; "no such descriptor" is
/// reported as [`TransferError::NotFound`] and mapped to an absence by the
/// model layer above.
pub trait TransferEngine: Send + Sync + 'static {
    /// Enumerate the devices currently on the bus.
    fn list_devices(&self) -> EngineResult<Vec<DeviceIdent>>;

    /// Raw 18-byte device descriptor.
    fn device_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>>;

    /// Identity of the parent hub, if the device has one.
    fn parent(&self, device: &DeviceIdent) -> Option<DeviceIdent>;

    /// Open a device for transfers and control-plane operations.
    fn open_device(&self, device: &DeviceIdent) -> EngineResult<()>;

    /// Close a previously opened device, releasing native resources.
    fn close_device(&self, device: &DeviceIdent);

    /// Raw bytes of the active configuration descriptor block.
    fn active_config_descriptor(&self, device: &DeviceIdent) -> EngineResult<Vec<u8>>;

    /// Raw bytes of every configuration descriptor block.
    fn config_descriptors(&self, device: &DeviceIdent) -> EngineResult<Vec<Vec<u8>>>;

    /// Select a configuration by bConfigurationValue.
    fn set_configuration(&self, device: &DeviceIdent, value: u8) -> EngineResult<()>;

    /// Claim an interface for exclusive use.
    fn claim_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()>;

    /// Release a previously claimed interface.
    fn release_interface(&self, device: &DeviceIdent, number: u8) -> EngineResult<()>;

    /// Activate an alternate setting on a claimed interface.
    fn set_alt_setting(&self, device: &DeviceIdent, number: u8, alt: u8) -> EngineResult<()>;

    /// Whether a kernel driver is bound to the interface.
    fn kernel_driver_active(&self, device: &DeviceIdent, number: u8) -> EngineResult<bool>;

    /// Unbind the kernel driver from the interface.
    fn detach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()>;

    /// Rebind the kernel driver to the interface.
    fn attach_kernel_driver(&self, device: &DeviceIdent, number: u8) -> EngineResult<()>;

    /// Clear a halt/stall condition on an endpoint.
    fn clear_halt(&self, device: &DeviceIdent, endpoint: u8) -> EngineResult<()>;

    /// Perform a port reset on the device.
    fn reset_device(&self, device: &DeviceIdent) -> EngineResult<()>;

    /// Submit one asynchronous transfer.
    ///
    /// `timeout_ms` of 0 means unbounded. The engine owns `buffer` until the
    /// completion fires and hands it back inside the [`Completion`].
    #[allow(clippy::too_many_arguments)]
    fn submit_transfer(
        &self,
        device: &DeviceIdent,
        endpoint: u8,
        kind: TransferKind,
        timeout_ms: u32,
        buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> EngineResult<TransferHandle>;

    /// Request cancellation of a pending transfer.
    ///
    /// Returns false when the transfer cannot be cancelled (already
    /// settling, or the engine does not support cancellation); the transfer
    /// then settles through its normal completion, e.g. at its timeout.
    fn cancel_transfer(&self, handle: TransferHandle) -> bool;

    /// Start delivering hotplug events into `sink`.
    fn enable_hotplug(&self, sink: broadcast::Sender<HotplugEvent>) -> EngineResult<()>;

    /// Stop delivering hotplug events and release the notification channel.
    fn disable_hotplug(&self);
}
