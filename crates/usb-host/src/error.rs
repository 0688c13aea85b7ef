//! Host-side error types
//!
//! Failures split along two axes. [`UsageError`] is programmer misuse,
//! detected synchronously before any I/O is attempted. [`TransferError`] is
//! what the transfer engine reports, and always arrives through the
//! operation's own completion path, never across it.

use thiserror::Error;
use usb_wire::{Direction, WireError};

/// Programmer misuse, raised in the caller's synchronous call frame
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    /// Operation requires the device to be open
    #[error("device is not open")]
    DeviceNotOpen,

    /// Control data kind does not match bit 7 of bmRequestType
    #[error("control data kind does not match the transfer direction")]
    ControlDirectionMismatch,

    /// Control payload cannot be described by a 16-bit wLength
    #[error("control payload exceeds the 16-bit wLength limit")]
    ControlDataTooLarge,

    /// Operation only makes sense on an endpoint of the other direction
    #[error("operation requires an {expected:?} endpoint")]
    EndpointDirection { expected: Direction },

    /// A streaming session is already running on this endpoint
    #[error("streaming is already active on this endpoint")]
    PollActive,

    /// No streaming session is running on this endpoint
    #[error("streaming is not active on this endpoint")]
    PollNotActive,

    /// Streaming needs at least one transfer in flight
    #[error("streaming requires at least one transfer in flight")]
    PollCountZero,

    /// Interface release while endpoint streams are active or draining
    #[error("interface has endpoints with active streams")]
    StreamsActive,

    /// Requested alternate setting is not declared by the interface
    #[error("alternate setting {alt} is not declared by interface {interface}")]
    UnknownAltSetting { interface: u8, alt: u8 },
}

/// Transport failure codes reported by the transfer engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// I/O failure
    #[error("input/output error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied (insufficient permissions)
    #[error("access denied")]
    Access,
    /// Device disconnected
    #[error("no such device")]
    NoDevice,
    /// Entity not found
    #[error("entity not found")]
    NotFound,
    /// Resource busy
    #[error("resource busy")]
    Busy,
    /// Transfer timed out
    #[error("operation timed out")]
    Timeout,
    /// Buffer overflow
    #[error("overflow")]
    Overflow,
    /// Endpoint stalled the request (protocol STALL)
    #[error("pipe error (stall)")]
    Pipe,
    /// Interrupted system call
    #[error("system call interrupted")]
    Interrupted,
    /// Out of memory
    #[error("insufficient memory")]
    NoMem,
    /// Operation not supported on this platform or device
    #[error("operation not supported")]
    NotSupported,
    /// Transfer was cancelled before completion
    #[error("transfer cancelled")]
    Cancelled,
    /// Other engine error with message
    #[error("transfer engine error: {0}")]
    Other(String),
}

/// Top-level error type for host operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Synchronous programmer misuse
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// Transport failure delivered on the completion path
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Malformed descriptor bytes from the device
    #[error("descriptor error: {0}")]
    Wire(#[from] WireError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for host operation results
pub type Result<T> = std::result::Result<T, Error>;
