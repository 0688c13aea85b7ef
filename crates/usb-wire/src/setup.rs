//! Control setup packet codec
//!
//! Every control transfer starts with a fixed 8-byte setup packet with
//! little-endian 16-bit fields: bmRequestType, bRequest, wValue, wIndex,
//! wLength. Bit 7 of bmRequestType carries the data-phase direction.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::descriptors::Direction;
use crate::error::{Result, need};

/// Size of the control setup packet
pub const SETUP_PACKET_SIZE: usize = 8;

/// Request type class bits (bits 5..6 of bmRequestType)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Standard request defined by the USB specification
    Standard,
    /// Class-specific request
    Class,
    /// Vendor-specific request
    Vendor,
}

/// Request recipient bits (bits 0..4 of bmRequestType)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// The device as a whole
    Device,
    /// A specific interface
    Interface,
    /// A specific endpoint
    Endpoint,
    /// Other recipient
    Other,
}

/// Compose a bmRequestType byte from its three fields.
pub const fn request_type(direction: Direction, kind: RequestKind, recipient: Recipient) -> u8 {
    let direction = match direction {
        Direction::In => 0x80,
        Direction::Out => 0x00,
    };
    let kind = match kind {
        RequestKind::Standard => 0x00,
        RequestKind::Class => 0x20,
        RequestKind::Vendor => 0x40,
    };
    let recipient = match recipient {
        Recipient::Device => 0x00,
        Recipient::Interface => 0x01,
        Recipient::Endpoint => 0x02,
        Recipient::Other => 0x03,
    };
    direction | kind | recipient
}

/// The 8-byte control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// bmRequestType: direction, kind and recipient
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength: data-phase length in bytes
    pub length: u16,
}

impl SetupPacket {
    /// Data-phase direction from bit 7 of bmRequestType.
    pub fn direction(&self) -> Direction {
        Direction::from_request_type(self.request_type)
    }

    /// Encode into the 8-byte wire layout.
    pub fn encode(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0u8; SETUP_PACKET_SIZE];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    /// Decode from the 8-byte wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        need(bytes, SETUP_PACKET_SIZE)?;

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0x0409,
            length: 0x0012,
        };

        let bytes = setup.encode();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x06);
        assert_eq!(bytes[2], 0x00); // wValue low
        assert_eq!(bytes[3], 0x01); // wValue high
        assert_eq!(bytes[4], 0x09); // wIndex low
        assert_eq!(bytes[5], 0x04); // wIndex high
        assert_eq!(bytes[6], 0x12); // wLength low
        assert_eq!(bytes[7], 0x00); // wLength high
    }

    #[test]
    fn test_decode_round_trip() {
        let setup = SetupPacket {
            request_type: 0x21,
            request: 0x09,
            value: 0x0200,
            index: 0x0001,
            length: 64,
        };

        let decoded = SetupPacket::decode(&setup.encode()).unwrap();
        assert_eq!(decoded, setup);
        assert_eq!(decoded.direction(), Direction::Out);
    }

    #[test]
    fn test_request_type_composition() {
        assert_eq!(
            request_type(Direction::In, RequestKind::Standard, Recipient::Device),
            0x80
        );
        assert_eq!(
            request_type(Direction::Out, RequestKind::Class, Recipient::Interface),
            0x21
        );
        assert_eq!(
            request_type(Direction::In, RequestKind::Vendor, Recipient::Endpoint),
            0xc2
        );
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(SetupPacket::decode(&[0x80, 0x06]).is_err());
    }
}
