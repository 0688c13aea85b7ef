//! Host-side USB access library
//!
//! Builds a typed device model (devices, interfaces, endpoints) on top of a
//! pluggable native transfer engine. The model owns descriptor caching,
//! control-transfer framing, per-endpoint streaming with a bounded pool of
//! in-flight transfers, and refcount-gated hotplug notifications; the
//! engine owns the wire.
//!
//! The default engine is rusb-backed ([`RusbEngine`]); tests drive the same
//! model through the scriptable [`mock::MockEngine`].
//!
//! # Example
//!
//! ```no_run
//! use usb_host::HostContext;
//!
//! # async fn demo() -> usb_host::Result<()> {
//! let context = HostContext::new()?;
//! if let Some(device) = context.find_device(0x1234, 0x5678)? {
//!     device.open()?;
//!     let info = device.info().await?;
//!     println!("found {:?}", info.product);
//!     device.close();
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod context;
pub mod device;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod hotplug;
pub mod interface;
pub mod logging;
pub mod mock;
pub mod stream;

mod transfer;

pub use backend::RusbEngine;
pub use context::HostContext;
pub use device::{ControlData, DEFAULT_CONTROL_TIMEOUT_MS, Device, DeviceInfo};
pub use endpoint::Endpoint;
pub use engine::{
    Completion, CompletionFn, DeviceIdent, EngineResult, HotplugEvent, TransferEngine,
    TransferHandle,
};
pub use error::{Error, Result, TransferError, UsageError};
pub use hotplug::HotplugWatcher;
pub use interface::Interface;
pub use logging::setup_logging;
pub use stream::{DEFAULT_POLL_TRANSFERS, EndpointStream, StreamEvent};
