//! # SETUP Packet Decoding
//!
//! Every control transfer starts with an 8-byte SETUP packet. This module
//! turns the raw bytes the transport delivers into a [`SetupRequest`] with
//! typed accessors for the bit fields of `bmRequestType`.

use std::fmt;

use thiserror::Error;

use super::constants::{request, request_type, SETUP_PACKET_SIZE};

/// The direction of the data stage, bit 7 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// OUT: host to device.
    HostToDevice,
    /// IN: device to host.
    DeviceToHost,
}

/// The type of a request, bits 6:5 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A chapter 9 request that every device handles.
    Standard,
    /// A request defined by a device class.
    Class,
    /// A vendor-specific request.
    Vendor,
    /// The reserved encoding `0b11`.
    Reserved,
}

/// The recipient of a request, bits 4:0 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// The device as a whole.
    Device,
    /// The interface in the low byte of `wIndex`.
    Interface,
    /// The endpoint in the low byte of `wIndex`.
    Endpoint,
    /// Something else, defined by the class.
    Other,
    /// Any reserved recipient code.
    Reserved(u8),
}

/// The SETUP buffer handed over by the transport has the wrong size.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("SETUP packet must be {expected} bytes, got {0}", expected = SETUP_PACKET_SIZE)]
pub struct SetupParseError(pub usize);

/// A decoded USB control request.
///
/// For documentation of the fields, see Section "9.3 USB Device Requests"
/// in the USB 2.0 specification. The 16-bit fields arrive little-endian on
/// the wire and are stored in host order here; the `*_low`/`*_high`
/// accessors give access to their byte halves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetupRequest {
    /// `bmRequestType`: direction, type and recipient.
    pub request_type: u8,
    /// `bRequest`: the request code.
    pub request: u8,
    /// `wValue`: request-specific parameter.
    pub value: u16,
    /// `wIndex`: request-specific parameter, often an interface or endpoint.
    pub index: u16,
    /// `wLength`: length of the data stage, 0 if there is none.
    pub length: u16,
}

impl SetupRequest {
    /// Assemble a request from its fields.
    #[must_use]
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Decode a SETUP packet.
    ///
    /// No validation of the fields happens here. Requests that make no sense
    /// are rejected later by the handlers.
    pub fn parse(bytes: &[u8]) -> Result<Self, SetupParseError> {
        let bytes: &[u8; SETUP_PACKET_SIZE] =
            bytes.try_into().map_err(|_| SetupParseError(bytes.len()))?;

        Ok(Self::from_bytes(bytes))
    }

    /// Decode a SETUP packet of the correct size.
    #[must_use]
    pub const fn from_bytes(bytes: &[u8; SETUP_PACKET_SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Encode the request in wire format.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut bytes = [0; SETUP_PACKET_SIZE];

        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());

        bytes
    }

    /// The direction of the data stage.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        if self.request_type & request_type::DIRECTION_IN != 0 {
            Direction::DeviceToHost
        } else {
            Direction::HostToDevice
        }
    }

    /// Standard, class or vendor request.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match (self.request_type & request_type::TYPE_MASK) >> request_type::TYPE_SHIFT {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Who the request is addressed to.
    #[must_use]
    pub const fn recipient(&self) -> Recipient {
        match self.request_type & request_type::RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            other => Recipient::Reserved(other),
        }
    }

    /// Returns true for a standard request addressed to `recipient`.
    #[must_use]
    pub fn is_standard_for(&self, recipient: Recipient) -> bool {
        self.kind() == RequestKind::Standard && self.recipient() == recipient
    }

    /// Returns true if the request has no data stage.
    #[must_use]
    pub const fn has_no_data(&self) -> bool {
        self.length == 0
    }

    /// The low byte of `wValue`, e.g. the descriptor index.
    #[must_use]
    pub const fn value_low(&self) -> u8 {
        self.value.to_le_bytes()[0]
    }

    /// The high byte of `wValue`, e.g. the descriptor type.
    #[must_use]
    pub const fn value_high(&self) -> u8 {
        self.value.to_le_bytes()[1]
    }

    /// The low byte of `wIndex`, e.g. an interface or endpoint.
    #[must_use]
    pub const fn index_low(&self) -> u8 {
        self.index.to_le_bytes()[0]
    }

    /// The high byte of `wIndex`.
    #[must_use]
    pub const fn index_high(&self) -> u8 {
        self.index.to_le_bytes()[1]
    }

    /// A GET_DESCRIPTOR request for the device as recipient.
    #[must_use]
    pub const fn get_descriptor(descriptor_type: u8, descriptor_index: u8, length: u16) -> Self {
        Self::new(
            request_type::DIRECTION_IN,
            request::GET_DESCRIPTOR,
            u16::from_le_bytes([descriptor_index, descriptor_type]),
            0,
            length,
        )
    }

    /// A GET_DESCRIPTOR request for a string in a given language.
    #[must_use]
    pub const fn get_string_descriptor(string_index: u8, lang_id: u16, length: u16) -> Self {
        let mut setup =
            Self::get_descriptor(super::constants::descriptor_type::STRING, string_index, length);
        setup.index = lang_id;
        setup
    }

    /// A SET_ADDRESS request.
    #[must_use]
    pub const fn set_address(address: u8) -> Self {
        Self::new(0, request::SET_ADDRESS, address as u16, 0, 0)
    }

    /// A SET_CONFIGURATION request.
    #[must_use]
    pub const fn set_configuration(configuration: u8) -> Self {
        Self::new(0, request::SET_CONFIGURATION, configuration as u16, 0, 0)
    }

    /// A GET_CONFIGURATION request.
    #[must_use]
    pub const fn get_configuration() -> Self {
        Self::new(request_type::DIRECTION_IN, request::GET_CONFIGURATION, 0, 0, 1)
    }
}

impl fmt::Display for SetupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType={:#04x} bRequest={:#04x} wValue={:#06x} wIndex={:#06x} wLength={}",
            self.request_type, self.request, self.value, self.index, self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_get_device_descriptor() {
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];

        let setup = SetupRequest::parse(&bytes).unwrap();

        assert_eq!(setup.direction(), Direction::DeviceToHost);
        assert_eq!(setup.kind(), RequestKind::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!(setup.request, request::GET_DESCRIPTOR);
        assert_eq!(setup.value_high(), 1, "descriptor type lives in the high byte");
        assert_eq!(setup.value_low(), 0, "descriptor index lives in the low byte");
        assert_eq!(setup.length, 64);
        assert_eq!(setup, SetupRequest::get_descriptor(1, 0, 64));
    }

    #[test]
    fn decode_class_interface_request() {
        // SET_LINE_CODING to interface 0 with 7 bytes of data.
        let bytes = [0x21, 0x20, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00];

        let setup = SetupRequest::parse(&bytes).unwrap();

        assert_eq!(setup.direction(), Direction::HostToDevice);
        assert_eq!(setup.kind(), RequestKind::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert!(!setup.is_standard_for(Recipient::Interface));
    }

    #[test]
    fn reserved_fields_decode_as_reserved() {
        let setup = SetupRequest::new(0x7f, 0, 0, 0, 0);

        assert_eq!(setup.kind(), RequestKind::Reserved);
        assert_eq!(setup.recipient(), Recipient::Reserved(0x1f));
    }

    #[test]
    fn wrong_sized_buffers_are_rejected() {
        assert_eq!(SetupRequest::parse(&[0; 7]), Err(SetupParseError(7)));
        assert_eq!(SetupRequest::parse(&[0; 9]), Err(SetupParseError(9)));
    }

    #[test]
    fn string_descriptor_request_carries_language() {
        let setup = SetupRequest::get_string_descriptor(2, 0x0409, 255);

        assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xff, 0x00]);
        assert_eq!(setup.index_low(), 0x09);
        assert_eq!(setup.index_high(), 0x04);
    }

    proptest! {
        #[test]
        fn wire_fields_are_little_endian(bytes: [u8; 8]) {
            let setup = SetupRequest::from_bytes(&bytes);

            prop_assert_eq!(setup.value_low(), bytes[2]);
            prop_assert_eq!(setup.value_high(), bytes[3]);
            prop_assert_eq!(setup.index_low(), bytes[4]);
            prop_assert_eq!(setup.index_high(), bytes[5]);
            prop_assert_eq!(setup.length.to_le_bytes(), [bytes[6], bytes[7]]);
            prop_assert_eq!(setup.to_bytes(), bytes);
        }

        #[test]
        fn direction_follows_bit_seven(request_type: u8) {
            let setup = SetupRequest::new(request_type, 0, 0, 0, 0);

            prop_assert_eq!(
                setup.direction() == Direction::DeviceToHost,
                request_type & 0x80 != 0
            );
        }
    }
}
