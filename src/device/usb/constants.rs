//! # USB Constants
//!
//! This module collects the USB 2.0 chapter 9 constants the control-transfer
//! engine needs. All definitions are derived from the "Universal Serial Bus
//! Specification Revision 2.0", Section 9.3 and 9.4.

// Allow missing docs to avoid duplicating the USB spec for all constants.
#![allow(missing_docs)]

/// The size of a SETUP packet in bytes.
pub const SETUP_PACKET_SIZE: usize = 8;

/// The default control endpoint.
pub const ENDPOINT0: u8 = 0;

/// The highest address a device can be assigned.
pub const MAX_DEVICE_ADDRESS: u8 = 127;

/// Masks and shifts for the `bmRequestType` field.
pub mod request_type {
    /// Bit 7: 1 = device-to-host.
    pub const DIRECTION_IN: u8 = 1 << 7;

    pub const TYPE_MASK: u8 = 0b0110_0000;
    pub const TYPE_SHIFT: u8 = 5;

    pub const RECIPIENT_MASK: u8 = 0b0001_1111;
}

/// Standard request codes (`bRequest`).
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// Descriptor type codes (high byte of `wValue` in GET_DESCRIPTOR).
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_BOS: u8 = 0x0f;
    pub const DEVICE_CAPABILITY: u8 = 0x10;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// Feature selectors for SET_FEATURE/CLEAR_FEATURE.
pub mod feature {
    pub const ENDPOINT_STALL: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// Bits of the device-level feature byte (`Current_Feature`).
///
/// The layout matches `bmAttributes` of the configuration descriptor, which
/// is what the byte is initialized from on bus reset.
pub mod current_feature {
    pub const REMOTE_WAKEUP: u8 = 1 << 5;
    pub const SELF_POWERED: u8 = 1 << 6;
}

/// Bits of the two-byte GET_STATUS response.
pub mod status {
    /// Device: self powered. Endpoint: halted.
    pub const SELF_POWERED_OR_HALT: u8 = 1 << 0;
    /// Device: remote wakeup enabled.
    pub const REMOTE_WAKEUP: u8 = 1 << 1;
}

/// Fields of the endpoint number in `wIndex` for endpoint recipients.
pub mod endpoint_index {
    pub const DIRECTION_IN: u8 = 1 << 7;
    pub const NUMBER_MASK: u8 = 0x0f;
    pub const RESERVED_MASK: u8 = 0x70;
}

/// Class-specific request codes for the CDC abstract control model.
pub mod cdc {
    pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
    pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
    pub const SET_COMM_FEATURE: u8 = 0x02;
    pub const GET_COMM_FEATURE: u8 = 0x03;
    pub const CLEAR_COMM_FEATURE: u8 = 0x04;
    pub const SET_LINE_CODING: u8 = 0x20;
    pub const GET_LINE_CODING: u8 = 0x21;
    pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
    pub const SEND_BREAK: u8 = 0x23;

    /// The size of the line coding structure in bytes.
    pub const LINE_CODING_SIZE: usize = 7;
}

/// String descriptor language IDs.
pub mod lang_id {
    /// English (US)
    pub const ENGLISH_US: u16 = 0x0409;
}
