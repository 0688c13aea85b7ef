//! Wire-level error types

use thiserror::Error;

/// Errors produced while decoding raw descriptor bytes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the structure it claims to hold
    #[error("descriptor truncated: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// bDescriptorType did not match the expected descriptor
    #[error("unexpected descriptor type: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedType { expected: u8, actual: u8 },

    /// A bLength field too small to delimit its own record
    #[error("invalid descriptor length field: {length}")]
    InvalidLength { length: u8 },
}

/// Type alias for wire decoding results
pub type Result<T> = std::result::Result<T, WireError>;

/// Check that `bytes` holds at least `needed` bytes.
pub(crate) fn need(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}
