//! # Virtual COM Port
//!
//! A CDC abstract control model device with one communication interface
//! and one data interface. Only the control side is modelled: the line
//! coding, the control line state and the comm feature requests.

use std::fmt;

use tracing::{debug, info, trace, warn};

use super::class::{DataSetup, DeviceProperties, StandardHooks, UsbClass};
use super::constants::cdc;
use super::descriptors::{
    BosDescriptor, ConfigurationAttributes, ConfigurationDescriptor, CsInterfaceDescriptor, DescriptorSet,
    DeviceDescriptor, EndpointDescriptor, InterfaceBlock, InterfaceDescriptor, TransferType,
};
use super::error::RequestError;
use super::session::DeviceSession;
use super::setup::{RequestKind, Recipient, SetupRequest};
use super::stream::{BytesStream, InStream};
use crate::device::transport::{EndpointStatus, EndpointTransport};

const VENDOR_ID: u16 = 0x0483;
const PRODUCT_ID: u16 = 0x5740;

static STRINGS: &[&str] = &[
    "HK32",                  // Manufacturer
    "HK32 Virtual COM Port", // Product
    "HK32L0xx0001",          // Serial number
];

/// Bulk IN endpoint of the data interface.
pub const DATA_IN_ENDPOINT: u8 = 1;
/// Interrupt IN endpoint of the communication interface.
pub const NOTIFICATION_ENDPOINT: u8 = 2;
/// Bulk OUT endpoint of the data interface.
pub const DATA_OUT_ENDPOINT: u8 = 3;

const DATA_PACKET_SIZE: u16 = 64;
const NOTIFICATION_PACKET_SIZE: u16 = 8;

/// The interfaces of the only configuration.
const INTERFACE_COUNT: u8 = 2;

/// The serial parameters the host selected with SET_LINE_CODING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    /// Data terminal rate in bits per second.
    pub baud_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5 stop bits, 2 = 2 stop bits.
    pub char_format: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space.
    pub parity_type: u8,
    /// 5, 6, 7, 8 or 16.
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            char_format: 0,
            parity_type: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    /// Encode the 7-byte wire format.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; cdc::LINE_CODING_SIZE] {
        let baud = self.baud_rate.to_le_bytes();

        [
            baud[0],
            baud[1],
            baud[2],
            baud[3],
            self.char_format,
            self.parity_type,
            self.data_bits,
        ]
    }

    /// Decode the wire format. Returns `None` unless `bytes` has exactly
    /// [`cdc::LINE_CODING_SIZE`] bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; cdc::LINE_CODING_SIZE] = bytes.try_into().ok()?;

        Some(Self {
            baud_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            char_format: bytes[4],
            parity_type: bytes[5],
            data_bits: bytes[6],
        })
    }
}

impl fmt::Display for LineCoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity_type {
            0 => 'N',
            1 => 'O',
            2 => 'E',
            3 => 'M',
            4 => 'S',
            _ => '?',
        };
        let stop_bits = match self.char_format {
            0 => "1",
            1 => "1.5",
            2 => "2",
            _ => "?",
        };

        write!(f, "{} {}{}{}", self.baud_rate, self.data_bits, parity, stop_bits)
    }
}

/// A virtual COM port.
#[derive(Debug)]
pub struct VirtualComPort {
    properties: DeviceProperties,
    descriptors: DescriptorSet,
    line_coding: LineCoding,
    control_line_state: u16,
    comm_feature: u16,
    /// The class request of the transfer in flight.
    request: Option<u8>,
    /// SET_LINE_CODING data received so far.
    received: Vec<u8>,
}

impl VirtualComPort {
    /// Create a port whose endpoint 0 uses `max_packet_size`.
    #[must_use]
    pub fn new(max_packet_size: u8) -> Self {
        let device = DeviceDescriptor {
            class: 0x02, // CDC
            max_packet_size_ep0: max_packet_size,
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            manufacturer_string: 1,
            product_string: 2,
            serial_number_string: 3,
            ..Default::default()
        };

        let communication = InterfaceBlock {
            interface: InterfaceDescriptor {
                interface_number: 0,
                interface_class: 0x02,    // CDC communication
                interface_subclass: 0x02, // abstract control model
                interface_protocol: 0x01, // V.25ter (AT commands)
                ..Default::default()
            },
            class_specific: vec![
                // Header, CDC 1.10
                CsInterfaceDescriptor {
                    subtype: 0x00,
                    payload: vec![0x10, 0x01],
                },
                // Call management, data interface 1
                CsInterfaceDescriptor {
                    subtype: 0x01,
                    payload: vec![0x00, 0x01],
                },
                // ACM: line coding and serial state
                CsInterfaceDescriptor {
                    subtype: 0x02,
                    payload: vec![0x02],
                },
                // Union of interface 0 and 1
                CsInterfaceDescriptor {
                    subtype: 0x06,
                    payload: vec![0x00, 0x01],
                },
            ],
            endpoints: vec![EndpointDescriptor {
                endpoint_address: 0x80 | NOTIFICATION_ENDPOINT,
                transfer_type: TransferType::Interrupt,
                max_packet_size: NOTIFICATION_PACKET_SIZE,
                interval: 0xff,
            }],
        };

        let data = InterfaceBlock {
            interface: InterfaceDescriptor {
                interface_number: 1,
                interface_class: 0x0a, // CDC data
                ..Default::default()
            },
            class_specific: Vec::new(),
            endpoints: vec![
                EndpointDescriptor {
                    endpoint_address: DATA_OUT_ENDPOINT,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: DATA_PACKET_SIZE,
                    interval: 0,
                },
                EndpointDescriptor {
                    endpoint_address: 0x80 | DATA_IN_ENDPOINT,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: DATA_PACKET_SIZE,
                    interval: 0,
                },
            ],
        };

        let configuration = ConfigurationDescriptor {
            attributes: ConfigurationAttributes::new(true, false),
            max_power: 0x32,
            interfaces: vec![communication, data],
            ..Default::default()
        };

        let descriptors = DescriptorSet::new(&device, &[configuration], STRINGS);

        Self {
            properties: DeviceProperties {
                max_packet_size: u16::from(max_packet_size),
                total_endpoints: DATA_OUT_ENDPOINT + 1,
                total_configurations: device.num_configurations,
            },
            descriptors,
            line_coding: LineCoding::default(),
            control_line_state: 0,
            comm_feature: 0,
            request: None,
            received: Vec::new(),
        }
    }

    /// Serve `bos` for GET_DESCRIPTOR(BOS).
    #[must_use]
    pub fn with_bos(mut self, bos: &BosDescriptor) -> Self {
        self.descriptors = self.descriptors.with_bos(bos);
        self
    }

    /// The line coding currently in effect.
    #[must_use]
    pub const fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    /// The last SET_CONTROL_LINE_STATE value.
    #[must_use]
    pub const fn control_line_state(&self) -> u16 {
        self.control_line_state
    }

    /// Data terminal ready.
    #[must_use]
    pub const fn dtr(&self) -> bool {
        self.control_line_state & 1 != 0
    }

    /// Request to send.
    #[must_use]
    pub const fn rts(&self) -> bool {
        self.control_line_state & 2 != 0
    }

    /// The last SET_COMM_FEATURE value.
    #[must_use]
    pub const fn comm_feature(&self) -> u16 {
        self.comm_feature
    }

    /// The descriptors the port serves.
    #[must_use]
    pub const fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    fn is_interface_class_request(setup: &SetupRequest) -> bool {
        setup.kind() == RequestKind::Class && setup.recipient() == Recipient::Interface
    }
}

impl Default for VirtualComPort {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StandardHooks for VirtualComPort {
    fn on_set_configuration(
        &mut self,
        session: &DeviceSession,
        _transport: &mut dyn EndpointTransport,
    ) {
        if session.is_configured() {
            info!("virtual COM port configured");
        } else {
            debug!("virtual COM port deconfigured");
        }
    }

    fn on_set_device_address(&mut self, session: &DeviceSession) {
        debug!("virtual COM port at address {}", session.address());
    }
}

impl UsbClass for VirtualComPort {
    fn properties(&self) -> DeviceProperties {
        self.properties
    }

    fn configuration_attributes(&self) -> u8 {
        ConfigurationAttributes::new(true, false).into()
    }

    fn reset(&mut self, transport: &mut dyn EndpointTransport) {
        self.request = None;
        self.received.clear();

        transport.set_tx_status(DATA_IN_ENDPOINT, EndpointStatus::Nak);
        transport.set_tx_status(NOTIFICATION_ENDPOINT, EndpointStatus::Nak);
        transport.set_rx_count(DATA_OUT_ENDPOINT, DATA_PACKET_SIZE);
        transport.set_rx_status(DATA_OUT_ENDPOINT, EndpointStatus::Valid);
    }

    fn data_setup(
        &mut self,
        setup: &SetupRequest,
        _session: &DeviceSession,
    ) -> Result<DataSetup, RequestError> {
        if !Self::is_interface_class_request(setup) {
            return Err(RequestError::Unsupported);
        }

        match setup.request {
            cdc::GET_LINE_CODING => {
                self.request = Some(setup.request);
                Ok(DataSetup::In(
                    BytesStream::from_vec(self.line_coding.to_bytes().to_vec()).boxed(),
                ))
            }
            cdc::SET_LINE_CODING => {
                self.request = Some(setup.request);
                self.received.clear();
                Ok(DataSetup::Out(cdc::LINE_CODING_SIZE))
            }
            _ => Err(RequestError::Unsupported),
        }
    }

    fn no_data_setup(
        &mut self,
        setup: &SetupRequest,
        _session: &DeviceSession,
    ) -> Result<(), RequestError> {
        if !Self::is_interface_class_request(setup) {
            return Err(RequestError::Unsupported);
        }

        match setup.request {
            cdc::SET_COMM_FEATURE => {
                self.comm_feature = setup.value;
                Ok(())
            }
            cdc::SET_CONTROL_LINE_STATE => {
                self.control_line_state = setup.value;
                debug!("DTR {} RTS {}", self.dtr(), self.rts());
                Ok(())
            }
            _ => Err(RequestError::Unsupported),
        }
    }

    fn interface_setting(&self, interface: u8, alternate_setting: u8) -> Result<(), RequestError> {
        if alternate_setting > 0 || interface >= INTERFACE_COUNT {
            return Err(RequestError::Unsupported);
        }

        Ok(())
    }

    fn data_out(&mut self, offset: usize, data: &[u8]) {
        trace!("line coding bytes {}..{}", offset, offset + data.len());

        self.received.truncate(offset);
        self.received.extend_from_slice(data);
    }

    fn device_descriptor(&self) -> Option<Box<dyn InStream>> {
        self.descriptors.device()
    }

    fn configuration_descriptor(&self, index: u8) -> Option<Box<dyn InStream>> {
        self.descriptors.configuration(index)
    }

    fn string_descriptor(&self, index: u8, lang_id: u16) -> Option<Box<dyn InStream>> {
        self.descriptors.string(index, lang_id)
    }

    fn bos_descriptor(&self) -> Option<Box<dyn InStream>> {
        self.descriptors.bos()
    }

    fn status_in(&mut self) {
        if self.request.take() == Some(cdc::SET_LINE_CODING) {
            match LineCoding::from_bytes(&self.received) {
                Some(coding) => {
                    info!("line coding {}", coding);
                    self.line_coding = coding;
                }
                None => warn!(
                    "ignoring line coding of {} bytes",
                    self.received.len()
                ),
            }
            self.received.clear();
        }
    }

    fn status_out(&mut self) {
        self.request = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::usb::constants::request_type;
    use proptest::prelude::*;

    const CLASS_INTERFACE_OUT: u8 = 0x21;

    #[test]
    fn default_line_coding_is_115200_8n1() {
        let coding = LineCoding::default();

        assert_eq!(coding.to_bytes(), [0x00, 0xc2, 0x01, 0x00, 0, 0, 8]);
        assert_eq!(coding.to_string(), "115200 8N1");
    }

    #[test]
    fn configuration_descriptor_is_67_bytes() {
        let port = VirtualComPort::default();
        let bytes = port.descriptors().configuration_bytes(0).unwrap();

        assert_eq!(bytes.len(), 67);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 67);
        assert_eq!(bytes[4], INTERFACE_COUNT);
    }

    #[test]
    fn interface_settings() {
        let port = VirtualComPort::default();

        assert_eq!(port.interface_setting(0, 0), Ok(()));
        assert_eq!(port.interface_setting(1, 0), Ok(()));
        assert_eq!(port.interface_setting(2, 0), Err(RequestError::Unsupported));
        assert_eq!(port.interface_setting(0, 1), Err(RequestError::Unsupported));
    }

    #[test]
    fn line_coding_is_committed_on_status() {
        let mut port = VirtualComPort::default();
        let session = DeviceSession::default();
        let setup = SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_LINE_CODING, 0, 0, 7);

        let stage = port.data_setup(&setup, &session).unwrap();
        assert!(matches!(stage, DataSetup::Out(7)));

        port.data_out(0, &[0x80, 0x25, 0x00, 0x00, 2, 1, 7]);
        assert_eq!(port.line_coding(), LineCoding::default());

        port.status_in();
        assert_eq!(port.line_coding().to_string(), "9600 7O2");
    }

    #[test]
    fn short_line_coding_is_ignored() {
        let mut port = VirtualComPort::default();
        let session = DeviceSession::default();
        let setup = SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_LINE_CODING, 0, 0, 7);

        port.data_setup(&setup, &session).unwrap();
        port.data_out(0, &[0x80, 0x25]);
        port.status_in();

        assert_eq!(port.line_coding(), LineCoding::default());
    }

    #[test]
    fn control_line_state() {
        let mut port = VirtualComPort::default();
        let session = DeviceSession::default();
        let setup = SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_CONTROL_LINE_STATE, 3, 0, 0);

        assert_eq!(port.no_data_setup(&setup, &session), Ok(()));
        assert!(port.dtr());
        assert!(port.rts());
    }

    #[test]
    fn requests_to_other_recipients_are_rejected() {
        let mut port = VirtualComPort::default();
        let session = DeviceSession::default();
        // Class request addressed to the device.
        let setup = SetupRequest::new(
            request_type::DIRECTION_IN | 0x20,
            cdc::GET_LINE_CODING,
            0,
            0,
            7,
        );

        assert!(matches!(
            port.data_setup(&setup, &session),
            Err(RequestError::Unsupported)
        ));
    }

    proptest! {
        #[test]
        fn line_coding_wire_format(baud_rate: u32, char_format in 0u8..3, parity_type in 0u8..5, data_bits in 5u8..=8) {
            let coding = LineCoding { baud_rate, char_format, parity_type, data_bits };

            prop_assert_eq!(LineCoding::from_bytes(&coding.to_bytes()), Some(coding));
        }
    }
}
