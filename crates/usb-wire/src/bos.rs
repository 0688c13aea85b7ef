//! Binary Object Store descriptor parsing
//!
//! The BOS descriptor is a 5-byte header (bLength, bDescriptorType,
//! wTotalLength, bNumDeviceCaps) followed by a sequence of variable-length
//! device capability records. Each record is self-delimited by its own first
//! byte, which is also the stride to the next record.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::descriptor_type;
use crate::error::{Result, WireError, need};

/// Size of the fixed BOS header
pub const BOS_HEADER_SIZE: usize = 5;

/// Minimum size of a capability record: bLength, bDescriptorType,
/// bDevCapabilityType
pub const CAPABILITY_HEADER_SIZE: usize = 3;

/// Read wTotalLength out of a BOS header probe.
///
/// Used for the first phase of the two-phase fetch: request just the header,
/// learn the full size, then request the whole block.
pub fn read_total_length(header: &[u8]) -> Result<u16> {
    need(header, 4)?;

    if header[1] != descriptor_type::BOS {
        return Err(WireError::UnexpectedType {
            expected: descriptor_type::BOS,
            actual: header[1],
        });
    }

    Ok(LittleEndian::read_u16(&header[2..4]))
}

/// One device capability record inside a BOS descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Record length in bytes (bLength)
    pub length: u8,
    /// Descriptor type code (bDescriptorType, 0x10)
    pub descriptor_type: u8,
    /// Capability type code (bDevCapabilityType)
    pub capability_type: u8,
    /// Capability-specific payload: record bytes 3..bLength
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A parsed Binary Object Store descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BosDescriptor {
    /// Header length in bytes (bLength)
    pub length: u8,
    /// Descriptor type code (bDescriptorType, 0x0f)
    pub descriptor_type: u8,
    /// Total length of header plus all capability records (wTotalLength)
    pub total_length: u16,
    /// Declared capability count (bNumDeviceCaps)
    pub num_device_caps: u8,
    /// Capability records in descriptor order
    pub capabilities: Vec<Capability>,
}

impl BosDescriptor {
    /// Parse a full BOS block.
    ///
    /// Walks capability records until the cumulative offset reaches
    /// wTotalLength (clamped to the bytes actually received). A record whose
    /// bLength cannot hold its own header, or which overruns the block, is a
    /// wire error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        need(bytes, BOS_HEADER_SIZE)?;

        if bytes[1] != descriptor_type::BOS {
            return Err(WireError::UnexpectedType {
                expected: descriptor_type::BOS,
                actual: bytes[1],
            });
        }

        if (bytes[0] as usize) < BOS_HEADER_SIZE {
            return Err(WireError::InvalidLength { length: bytes[0] });
        }

        let total_length = LittleEndian::read_u16(&bytes[2..4]);
        let end = bytes.len().min(total_length as usize);

        let mut capabilities = Vec::new();
        let mut offset = bytes[0] as usize;

        while offset < end {
            if offset + CAPABILITY_HEADER_SIZE > end {
                return Err(WireError::Truncated {
                    needed: offset + CAPABILITY_HEADER_SIZE,
                    available: end,
                });
            }

            let record_len = bytes[offset] as usize;
            if record_len < CAPABILITY_HEADER_SIZE {
                return Err(WireError::InvalidLength {
                    length: bytes[offset],
                });
            }
            if offset + record_len > end {
                return Err(WireError::Truncated {
                    needed: offset + record_len,
                    available: end,
                });
            }

            capabilities.push(Capability {
                length: bytes[offset],
                descriptor_type: bytes[offset + 1],
                capability_type: bytes[offset + 2],
                data: bytes[offset + CAPABILITY_HEADER_SIZE..offset + record_len].to_vec(),
            });

            offset += record_len;
        }

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            total_length,
            num_device_caps: bytes[4],
            capabilities,
        })
    }
}
