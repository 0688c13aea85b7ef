//! Standard USB descriptor parsing
//!
//! Parses the raw byte buffers returned by a transfer engine into the
//! descriptor object model: a device descriptor, and a configuration tree
//! of interfaces (grouped by interface number, one entry per alternate
//! setting) and their endpoints.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::descriptor_type;
use crate::error::{Result, WireError, need};

/// Size of the fixed device descriptor (USB 3.2 §9.6.1)
pub const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// Size of the fixed part of a configuration descriptor
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;

/// Size of an interface descriptor
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;

/// Size of an endpoint descriptor (without audio extensions)
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;

/// Direction bit in an endpoint address or bmRequestType (bit 7)
pub const DIRECTION_MASK: u8 = 0x80;

/// Endpoint number bits of an endpoint address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x7f;

/// Transfer direction, fixed at descriptor parse time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn from_address(address: u8) -> Self {
        if address & DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Direction encoded in bit 7 of a bmRequestType byte.
    pub fn from_request_type(request_type: u8) -> Self {
        Self::from_address(request_type)
    }
}

/// Endpoint transfer type, the 2-bit field in bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfers (endpoint 0)
    Control,
    /// Isochronous transfers
    Isochronous,
    /// Bulk transfers
    Bulk,
    /// Interrupt transfers
    Interrupt,
}

impl TransferKind {
    /// Transfer type from the low two bits of bmAttributes.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

/// The fixed 18-byte device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Descriptor length in bytes (bLength)
    pub length: u8,
    /// Descriptor type code (bDescriptorType, 0x01)
    pub descriptor_type: u8,
    /// USB specification revision, binary-coded decimal (bcdUSB)
    pub bcd_usb: u16,
    /// Device class code
    pub class_code: u8,
    /// Device subclass code
    pub sub_class_code: u8,
    /// Device protocol code
    pub protocol_code: u8,
    /// Maximum packet size of endpoint 0
    pub max_packet_size_0: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number, binary-coded decimal (bcdDevice)
    pub bcd_device: u16,
    /// String descriptor index of the manufacturer name (0 = none)
    pub manufacturer_index: u8,
    /// String descriptor index of the product name (0 = none)
    pub product_index: u8,
    /// String descriptor index of the serial number (0 = none)
    pub serial_number_index: u8,
    /// Number of configurations
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse a raw 18-byte device descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        need(bytes, DEVICE_DESCRIPTOR_SIZE)?;

        if bytes[1] != descriptor_type::DEVICE {
            return Err(WireError::UnexpectedType {
                expected: descriptor_type::DEVICE,
                actual: bytes[1],
            });
        }

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            bcd_usb: LittleEndian::read_u16(&bytes[2..4]),
            class_code: bytes[4],
            sub_class_code: bytes[5],
            protocol_code: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: LittleEndian::read_u16(&bytes[8..10]),
            product_id: LittleEndian::read_u16(&bytes[10..12]),
            bcd_device: LittleEndian::read_u16(&bytes[12..14]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// One endpoint declaration inside an alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Descriptor length in bytes (bLength)
    pub length: u8,
    /// Descriptor type code (bDescriptorType, 0x05)
    pub descriptor_type: u8,
    /// Endpoint address: 7-bit endpoint number plus direction bit 7
    pub address: u8,
    /// bmAttributes: transfer type in the low two bits
    pub attributes: u8,
    /// Maximum packet size (wMaxPacketSize)
    pub max_packet_size: u16,
    /// Polling interval (bInterval)
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Parse a raw endpoint descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        need(bytes, ENDPOINT_DESCRIPTOR_SIZE)?;

        if bytes[1] != descriptor_type::ENDPOINT {
            return Err(WireError::UnexpectedType {
                expected: descriptor_type::ENDPOINT,
                actual: bytes[1],
            });
        }

        Ok(Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: LittleEndian::read_u16(&bytes[4..6]),
            interval: bytes[6],
        })
    }

    /// Endpoint number without the direction bit.
    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    /// Direction fixed by bit 7 of the address.
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    /// Transfer type from bmAttributes.
    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }
}

/// One alternate setting of an interface, with its endpoint list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAltSetting {
    /// Interface number this setting belongs to
    pub interface_number: u8,
    /// Alternate setting value
    pub alternate_setting: u8,
    /// Interface class code
    pub class_code: u8,
    /// Interface subclass code
    pub sub_class_code: u8,
    /// Interface protocol code
    pub protocol_code: u8,
    /// String descriptor index for this interface (0 = none)
    pub interface_index: u8,
    /// Endpoints declared under this alternate setting
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceAltSetting {
    fn parse(bytes: &[u8]) -> Result<Self> {
        need(bytes, INTERFACE_DESCRIPTOR_SIZE)?;

        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            class_code: bytes[5],
            sub_class_code: bytes[6],
            protocol_code: bytes[7],
            interface_index: bytes[8],
            endpoints: Vec::new(),
        })
    }
}

/// All alternate settings sharing one interface number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceGroup {
    /// Interface number
    pub number: u8,
    /// Alternate settings in descriptor order; index 0 is the default
    pub alt_settings: Vec<InterfaceAltSetting>,
}

/// A parsed configuration descriptor and its interface tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// Descriptor length in bytes (bLength)
    pub length: u8,
    /// Descriptor type code (bDescriptorType, 0x02)
    pub descriptor_type: u8,
    /// Total length of the configuration block (wTotalLength)
    pub total_length: u16,
    /// Number of interfaces in this configuration
    pub num_interfaces: u8,
    /// Value used with SET_CONFIGURATION
    pub configuration_value: u8,
    /// String descriptor index for this configuration (0 = none)
    pub configuration_index: u8,
    /// bmAttributes (power characteristics)
    pub attributes: u8,
    /// Maximum power draw in 2 mA units
    pub max_power: u8,
    /// Interfaces grouped by number
    pub interfaces: Vec<InterfaceGroup>,
}

impl ConfigDescriptor {
    /// Parse a full configuration block.
    ///
    /// Walks the sub-descriptors by their own bLength stride. Interface
    /// descriptors open a new alternate setting; endpoint descriptors attach
    /// to the most recent one; class-specific descriptors are skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        need(bytes, CONFIG_DESCRIPTOR_SIZE)?;

        if bytes[1] != descriptor_type::CONFIGURATION {
            return Err(WireError::UnexpectedType {
                expected: descriptor_type::CONFIGURATION,
                actual: bytes[1],
            });
        }

        if (bytes[0] as usize) < CONFIG_DESCRIPTOR_SIZE {
            return Err(WireError::InvalidLength { length: bytes[0] });
        }

        let total_length = LittleEndian::read_u16(&bytes[2..4]);

        let mut config = Self {
            length: bytes[0],
            descriptor_type: bytes[1],
            total_length,
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            configuration_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
            interfaces: Vec::new(),
        };

        let end = bytes.len().min(total_length as usize);
        let mut offset = bytes[0] as usize;

        while offset + 2 <= end {
            let record_len = bytes[offset] as usize;
            if record_len < 2 {
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

            let record = &bytes[offset..offset + record_len];
            match record[1] {
                descriptor_type::INTERFACE => {
                    let alt = InterfaceAltSetting::parse(record)?;
                    config.push_alt_setting(alt);
                }
                descriptor_type::ENDPOINT => {
                    let endpoint = EndpointDescriptor::parse(record)?;
                    // Endpoints before any interface descriptor are malformed
                    // input; drop them rather than misattribute them.
                    if let Some(alt) = config.last_alt_setting_mut() {
                        alt.endpoints.push(endpoint);
                    }
                }
                _ => {}
            }

            offset += record_len;
        }

        Ok(config)
    }

    /// Look up an interface group by number.
    pub fn interface(&self, number: u8) -> Option<&InterfaceGroup> {
        self.interfaces.iter().find(|group| group.number == number)
    }

    fn push_alt_setting(&mut self, alt: InterfaceAltSetting) {
        match self
            .interfaces
            .iter_mut()
            .find(|group| group.number == alt.interface_number)
        {
            Some(group) => group.alt_settings.push(alt),
            None => self.interfaces.push(InterfaceGroup {
                number: alt.interface_number,
                alt_settings: vec![alt],
            }),
        }
    }

    fn last_alt_setting_mut(&mut self) -> Option<&mut InterfaceAltSetting> {
        self.interfaces
            .last_mut()
            .and_then(|group| group.alt_settings.last_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device_descriptor() -> Vec<u8> {
        vec![
            0x12, // bLength
            0x01, // bDescriptorType (Device)
            0x00, 0x02, // bcdUSB (2.00)
            0x00, // bDeviceClass
            0x00, // bDeviceSubClass
            0x00, // bDeviceProtocol
            0x40, // bMaxPacketSize0 (64 bytes)
            0x34, 0x12, // idVendor (0x1234)
            0x78, 0x56, // idProduct (0x5678)
            0x00, 0x01, // bcdDevice (1.00)
            0x01, // iManufacturer
            0x02, // iProduct
            0x03, // iSerialNumber
            0x01, // bNumConfigurations
        ]
    }

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&sample_device_descriptor()).unwrap();

        assert_eq!(desc.length, 18);
        assert_eq!(desc.bcd_usb, 0x0200);
        assert_eq!(desc.max_packet_size_0, 64);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.serial_number_index, 3);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn test_parse_device_descriptor_truncated() {
        let result = DeviceDescriptor::parse(&[0x12, 0x01, 0x00]);
        assert_eq!(
            result,
            Err(WireError::Truncated {
                needed: 18,
                available: 3
            })
        );
    }

    #[test]
    fn test_parse_device_descriptor_wrong_type() {
        let mut bytes = sample_device_descriptor();
        bytes[1] = 0x02;
        let result = DeviceDescriptor::parse(&bytes);
        assert!(matches!(result, Err(WireError::UnexpectedType { .. })));
    }

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x01), Direction::Out);
        assert_eq!(Direction::from_request_type(0x80), Direction::In);
        assert_eq!(Direction::from_request_type(0x21), Direction::Out);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(
            TransferKind::from_attributes(0x01),
            TransferKind::Isochronous
        );
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Upper bits (sync/usage type) do not affect the kind
        assert_eq!(TransferKind::from_attributes(0x0e), TransferKind::Bulk);
    }

    #[test]
    fn test_parse_config_descriptor() {
        let bytes = vec![
            // Configuration descriptor
            0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
            // Interface descriptor (number 0, alt 0, one endpoint)
            0x09, 0x04, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00,
            // Endpoint descriptor (EP1 IN, bulk, 512 bytes)
            0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        ];

        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(config.total_length, 25);
        assert_eq!(config.num_interfaces, 1);
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.interfaces.len(), 1);

        let group = config.interface(0).unwrap();
        assert_eq!(group.alt_settings.len(), 1);

        let alt = &group.alt_settings[0];
        assert_eq!(alt.class_code, 0xff);
        assert_eq!(alt.endpoints.len(), 1);
        assert_eq!(alt.endpoints[0].address, 0x81);
        assert_eq!(alt.endpoints[0].max_packet_size, 512);
        assert_eq!(alt.endpoints[0].direction(), Direction::In);
        assert_eq!(alt.endpoints[0].transfer_kind(), TransferKind::Bulk);
    }

    #[test]
    fn test_parse_config_groups_alt_settings() {
        let bytes = vec![
            0x09, 0x02, 0x27, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
            // Interface 0 alt 0, no endpoints
            0x09, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00,
            // Interface 0 alt 1, one isochronous endpoint
            0x09, 0x04, 0x00, 0x01, 0x01, 0x01, 0x02, 0x00, 0x00,
            0x07, 0x05, 0x82, 0x01, 0xc0, 0x00, 0x01,
        ];

        let config = ConfigDescriptor::parse(&bytes).unwrap();
        assert_eq!(config.interfaces.len(), 1);

        let group = config.interface(0).unwrap();
        assert_eq!(group.alt_settings.len(), 2);
        assert_eq!(group.alt_settings[0].alternate_setting, 0);
        assert!(group.alt_settings[0].endpoints.is_empty());
        assert_eq!(group.alt_settings[1].alternate_setting, 1);
        assert_eq!(group.alt_settings[1].endpoints.len(), 1);
        assert_eq!(
            group.alt_settings[1].endpoints[0].transfer_kind(),
            TransferKind::Isochronous
        );
    }

    #[test]
    fn test_parse_config_skips_class_specific() {
        let bytes = vec![
            0x09, 0x02, 0x1c, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
            0x09, 0x04, 0x00, 0x00, 0x01, 0x03, 0x01, 0x01, 0x00,
            // HID class descriptor, must be skipped
            0x03, 0x21, 0x11,
            0x07, 0x05, 0x81, 0x03, 0x08, 0x00, 0x0a,
        ];

        let config = ConfigDescriptor::parse(&bytes).unwrap();
        let alt = &config.interface(0).unwrap().alt_settings[0];
        assert_eq!(alt.endpoints.len(), 1);
        assert_eq!(alt.endpoints[0].transfer_kind(), TransferKind::Interrupt);
    }

    #[test]
    fn test_parse_config_zero_length_record() {
        let mut bytes = vec![0x09, 0x02, 0x0b, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32];
        bytes.extend_from_slice(&[0x00, 0x00]);
        let result = ConfigDescriptor::parse(&bytes);
        assert!(matches!(result, Err(WireError::InvalidLength { .. })));
    }

    #[test]
    fn test_endpoint_number() {
        let ep = EndpointDescriptor {
            length: 7,
            descriptor_type: 0x05,
            address: 0x82,
            attributes: 0x02,
            max_packet_size: 64,
            interval: 0,
        };
        assert_eq!(ep.number(), 2);
    }
}
