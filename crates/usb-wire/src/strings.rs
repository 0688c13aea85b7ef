//! String descriptor decoding
//!
//! String descriptors carry a 2-byte header followed by UTF-16LE text.

use byteorder::{ByteOrder, LittleEndian};

use crate::descriptor_type;
use crate::error::{Result, WireError, need};

/// Language id for US English, the only language this host requests
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// Decode the UTF-16LE payload of a string descriptor.
///
/// The payload starts at byte offset 2 and runs to the descriptor's own
/// bLength, clamped to the bytes actually received. Unpaired surrogates are
/// replaced rather than rejected.
pub fn decode_string_descriptor(bytes: &[u8]) -> Result<String> {
    need(bytes, 2)?;

    if bytes[1] != descriptor_type::STRING {
        return Err(WireError::UnexpectedType {
            expected: descriptor_type::STRING,
            actual: bytes[1],
        });
    }

    let length = bytes[0] as usize;
    if length < 2 {
        return Err(WireError::InvalidLength { length: bytes[0] });
    }

    let payload = &bytes[2..length.min(bytes.len())];
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();

    Ok(String::from_utf16_lossy(&units))
}
