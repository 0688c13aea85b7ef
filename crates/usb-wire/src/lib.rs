//! Binary layouts of the USB host-side protocol
//!
//! This crate defines the fixed wire formats a USB host has to produce and
//! consume: the 8-byte control setup packet, the standard descriptor tree
//! (device, configuration, interface, endpoint), the Binary Object Store
//! with its capability records, and UTF-16LE string descriptors.
//!
//! It performs no I/O. Raw byte buffers come in, structured types come out,
//! and malformed input is reported as [`WireError`].
//!
//! # Example
//!
//! ```
//! use usb_wire::{SetupPacket, Direction};
//!
//! let setup = SetupPacket {
//!     request_type: 0x80,
//!     request: 0x06,
//!     value: 0x0100,
//!     index: 0,
//!     length: 18,
//! };
//!
//! let bytes = setup.encode();
//! assert_eq!(bytes.len(), 8);
//! assert_eq!(setup.direction(), Direction::In);
//! ```

pub mod bos;
pub mod descriptors;
pub mod error;
pub mod setup;
pub mod strings;

pub use bos::{BOS_HEADER_SIZE, BosDescriptor, Capability, read_total_length};
pub use descriptors::{
    ConfigDescriptor, DEVICE_DESCRIPTOR_SIZE, DeviceDescriptor, Direction, EndpointDescriptor,
    InterfaceAltSetting, InterfaceGroup, TransferKind,
};
pub use error::{Result, WireError};
pub use setup::{
    Recipient, RequestKind, SETUP_PACKET_SIZE, SetupPacket, request_type,
};
pub use strings::{LANGUAGE_ID_EN_US, decode_string_descriptor};

/// Standard descriptor type codes (USB 3.2 §9.4)
pub mod descriptor_type {
    /// Device descriptor
    pub const DEVICE: u8 = 0x01;
    /// Configuration descriptor
    pub const CONFIGURATION: u8 = 0x02;
    /// String descriptor
    pub const STRING: u8 = 0x03;
    /// Interface descriptor
    pub const INTERFACE: u8 = 0x04;
    /// Endpoint descriptor
    pub const ENDPOINT: u8 = 0x05;
    /// Binary Object Store descriptor
    pub const BOS: u8 = 0x0f;
    /// Device capability record inside a BOS descriptor
    pub const DEVICE_CAPABILITY: u8 = 0x10;
}

/// Standard request codes (USB 3.2 §9.4)
pub mod standard_request {
    /// GET_DESCRIPTOR
    pub const GET_DESCRIPTOR: u8 = 0x06;
    /// SET_CONFIGURATION
    pub const SET_CONFIGURATION: u8 = 0x09;
    /// SET_INTERFACE
    pub const SET_INTERFACE: u8 = 0x0b;
}

/// Lowest bcdUSB revision that advertises BOS support (USB 2.0.1)
pub const BOS_MIN_BCD_USB: u16 = 0x0201;
