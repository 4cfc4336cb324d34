//! # Simulated Host
//!
//! [`HostSimulator`] plays the host controller side of the bus for a
//! [`UsbDevice`] on a [`MemoryTransport`]. It runs complete control
//! transfers packet by packet, raising the endpoint 0 events the hardware
//! would raise, and retries NAKed tokens a bounded number of times.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info, trace};

use super::class::UsbClass;
use super::constants::{descriptor_type, lang_id, ENDPOINT0};
use super::device::UsbDevice;
use super::error::PropertiesError;
use super::pcap::{PcapCapture, STATUS_STALL};
use super::setup::SetupRequest;
use crate::device::transport::{Handshake, MemoryTransport};

/// How often a NAKed token is retried before giving up.
const DEFAULT_NAK_LIMIT: usize = 16;

const DEVICE_DESCRIPTOR_SIZE: usize = 18;

/// The stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The SETUP packet.
    Setup,
    /// The optional data packets.
    Data,
    /// The zero-length handshake in the opposite direction.
    Status,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Data => "data",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// Why a control transfer failed from the host's point of view.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The device answered with STALL.
    #[error("device stalled the {0} stage")]
    Stall(Stage),
    /// The endpoint was not armed at all.
    #[error("device did not respond in the {0} stage")]
    NoResponse(Stage),
    /// The device answered NAK more often than the NAK limit allows.
    #[error("device kept answering NAK in the {0} stage")]
    Timeout(Stage),
    /// The status packet carried data.
    #[error("device sent a {0} byte status packet")]
    BadStatus(usize),
    /// The data stage ended before the host got what it needs.
    #[error("device sent {received} bytes, expected {expected}")]
    ShortData {
        /// Bytes the request needs.
        expected: usize,
        /// Bytes the device sent.
        received: usize,
    },
}

/// What the host learned while enumerating a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    /// The address assigned with SET_ADDRESS.
    pub address: u8,
    /// The full device descriptor.
    pub device_descriptor: Vec<u8>,
    /// The configuration descriptor with all interfaces and endpoints.
    pub configuration_descriptor: Vec<u8>,
    /// The language IDs from string descriptor 0.
    pub languages: Vec<u16>,
    /// The manufacturer string, if the device names one.
    pub manufacturer: Option<String>,
    /// The product string, if the device names one.
    pub product: Option<String>,
    /// The serial number string, if the device names one.
    pub serial_number: Option<String>,
}

/// A host controller driving one device.
#[derive(Debug)]
pub struct HostSimulator<C> {
    device: UsbDevice<C, MemoryTransport>,
    capture: PcapCapture,
    nak_limit: usize,
}

impl<C: UsbClass> HostSimulator<C> {
    /// Attach a device with `class` to the bus and reset it.
    pub fn new(class: C) -> Result<Self, PropertiesError> {
        let endpoints = usize::from(class.properties().total_endpoints).clamp(1, 16);
        let mut device = UsbDevice::new(class, MemoryTransport::new(endpoints))?;

        device.power_on();
        device.bus_reset();

        Ok(Self {
            device,
            capture: PcapCapture::disabled(),
            nak_limit: DEFAULT_NAK_LIMIT,
        })
    }

    /// Record all control transfers into `capture`.
    #[must_use]
    pub fn with_capture(mut self, capture: PcapCapture) -> Self {
        self.capture = capture;
        self
    }

    /// Retry NAKed tokens at most `limit` times.
    #[must_use]
    pub fn with_nak_limit(mut self, limit: usize) -> Self {
        self.nak_limit = limit;
        self
    }

    /// The simulated device.
    #[must_use]
    pub const fn device(&self) -> &UsbDevice<C, MemoryTransport> {
        &self.device
    }

    /// The simulated device, e.g. to inject bus events.
    pub fn device_mut(&mut self) -> &mut UsbDevice<C, MemoryTransport> {
        &mut self.device
    }

    /// The capture the transfers are recorded into.
    pub fn capture_mut(&mut self) -> &mut PcapCapture {
        &mut self.capture
    }

    /// Signal a bus reset.
    pub fn bus_reset(&mut self) {
        self.device.bus_reset();
    }

    /// Run a control read and return the data stage.
    pub fn control_in(&mut self, setup: SetupRequest) -> Result<Vec<u8>, TransferError> {
        let result = self.read(setup);
        self.record(&setup, result.as_deref().unwrap_or_default(), result.is_err());
        result
    }

    /// Run a control write, or a no-data transfer if `data` is empty.
    pub fn control_out(&mut self, setup: SetupRequest, data: &[u8]) -> Result<(), TransferError> {
        let result = self.write(setup, data);
        self.record(&setup, data, result.is_err());
        result
    }

    /// Read descriptor `descriptor_type`/`index`, at most `length` bytes.
    pub fn get_descriptor(
        &mut self,
        descriptor_type: u8,
        index: u8,
        length: u16,
    ) -> Result<Vec<u8>, TransferError> {
        self.control_in(SetupRequest::get_descriptor(descriptor_type, index, length))
    }

    /// Read string descriptor `index` and decode it.
    pub fn get_string(&mut self, index: u8, lang: u16) -> Result<String, TransferError> {
        let bytes = self.control_in(SetupRequest::get_string_descriptor(index, lang, 255))?;

        let units: Vec<u16> = bytes
            .get(2..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .collect();

        Ok(String::from_utf16_lossy(&units))
    }

    /// Assign `address` to the device.
    pub fn set_address(&mut self, address: u8) -> Result<(), TransferError> {
        self.control_out(SetupRequest::set_address(address), &[])
    }

    /// Select `configuration`, 0 deconfigures the device.
    pub fn set_configuration(&mut self, configuration: u8) -> Result<(), TransferError> {
        self.control_out(SetupRequest::set_configuration(configuration), &[])
    }

    /// Read the selected configuration value.
    pub fn get_configuration(&mut self) -> Result<u8, TransferError> {
        let data = self.control_in(SetupRequest::get_configuration())?;
        data.first().copied().ok_or(TransferError::ShortData {
            expected: 1,
            received: 0,
        })
    }

    /// Enumerate the device the way an operating system would and select
    /// its first configuration.
    pub fn enumerate(&mut self, address: u8) -> Result<Enumeration, TransferError> {
        // The first read only learns the max packet size of endpoint 0.
        let head = self.get_descriptor(descriptor_type::DEVICE, 0, 64)?;
        debug!("device descriptor head {:02x?}", head);
        self.bus_reset();

        self.set_address(address)?;
        info!("device addressed as {}", address);

        let device_descriptor =
            self.get_descriptor(descriptor_type::DEVICE, 0, DEVICE_DESCRIPTOR_SIZE as u16)?;
        if device_descriptor.len() < DEVICE_DESCRIPTOR_SIZE {
            return Err(TransferError::ShortData {
                expected: DEVICE_DESCRIPTOR_SIZE,
                received: device_descriptor.len(),
            });
        }

        let header = self.get_descriptor(descriptor_type::CONFIGURATION, 0, 9)?;
        let total_length = header
            .get(2..4)
            .map_or(9, |length| u16::from_le_bytes([length[0], length[1]]));
        let configuration_descriptor =
            self.get_descriptor(descriptor_type::CONFIGURATION, 0, total_length)?;

        let languages: Vec<u16> = self
            .get_descriptor(descriptor_type::STRING, 0, 255)?
            .get(2..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|lang| u16::from_le_bytes([lang[0], lang[1]]))
            .collect();
        let lang = languages.first().copied().unwrap_or(lang_id::ENGLISH_US);

        let mut string = |offset: usize| -> Result<Option<String>, TransferError> {
            match device_descriptor.get(offset).copied() {
                Some(0) | None => Ok(None),
                Some(index) => self.get_string(index, lang).map(Some),
            }
        };
        let manufacturer = string(14)?;
        let product = string(15)?;
        let serial_number = string(16)?;

        let configuration_value = configuration_descriptor.get(5).copied().unwrap_or(1);
        self.set_configuration(configuration_value)?;
        info!("device configured with configuration {}", configuration_value);

        Ok(Enumeration {
            address,
            device_descriptor,
            configuration_descriptor,
            languages,
            manufacturer,
            product,
            serial_number,
        })
    }

    fn packet_size(&self) -> usize {
        usize::from(self.device.properties().max_packet_size)
    }

    fn send_setup(&mut self, setup: &SetupRequest) {
        trace!("host SETUP {}", setup);
        self.device
            .transport_mut()
            .receive_setup(&setup.to_bytes());
        self.device.setup0();
    }

    /// Issue IN tokens until the device answers with a packet.
    fn in_token(&mut self, stage: Stage) -> Result<Vec<u8>, TransferError> {
        for _ in 0..=self.nak_limit {
            match self.device.transport_mut().transmit_in(ENDPOINT0) {
                Ok(packet) => {
                    self.device.in0();
                    return Ok(packet);
                }
                Err(Handshake::Nak) => continue,
                Err(Handshake::Stall) => return Err(TransferError::Stall(stage)),
                Err(Handshake::NoResponse | Handshake::Ack) => {
                    return Err(TransferError::NoResponse(stage))
                }
            }
        }

        Err(TransferError::Timeout(stage))
    }

    /// Issue an OUT token with `data` until the device accepts it.
    fn out_token(&mut self, data: &[u8], stage: Stage) -> Result<(), TransferError> {
        for _ in 0..=self.nak_limit {
            match self.device.transport_mut().receive_out(ENDPOINT0, data) {
                Handshake::Ack => {
                    self.device.out0();
                    return Ok(());
                }
                Handshake::Nak => continue,
                Handshake::Stall => return Err(TransferError::Stall(stage)),
                Handshake::NoResponse => return Err(TransferError::NoResponse(stage)),
            }
        }

        Err(TransferError::Timeout(stage))
    }

    fn read(&mut self, setup: SetupRequest) -> Result<Vec<u8>, TransferError> {
        let requested = usize::from(setup.length);
        let packet_size = self.packet_size();
        let mut data = Vec::with_capacity(requested);

        self.send_setup(&setup);

        loop {
            let packet = self.in_token(Stage::Data)?;
            data.extend_from_slice(&packet);

            if packet.len() < packet_size || data.len() >= requested {
                break;
            }
        }

        self.out_token(&[], Stage::Status)?;

        trace!("control read of {} bytes", data.len());
        Ok(data)
    }

    fn write(&mut self, setup: SetupRequest, data: &[u8]) -> Result<(), TransferError> {
        let packet_size = self.packet_size();

        self.send_setup(&setup);

        for packet in data.chunks(packet_size) {
            self.out_token(packet, Stage::Data)?;
        }

        match self.in_token(Stage::Status)? {
            status if status.is_empty() => Ok(()),
            status => Err(TransferError::BadStatus(status.len())),
        }
    }

    fn record(&mut self, setup: &SetupRequest, data: &[u8], stalled: bool) {
        let address = self.device.transport().device_address();
        let status = if stalled { STATUS_STALL } else { 0 };

        self.capture.record_control(address, setup, data, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::usb::class::{DataSetup, DeviceProperties, StandardHooks};
    use crate::device::usb::constants::cdc;
    use crate::device::usb::descriptors::BosDescriptor;
    use crate::device::usb::error::RequestError;
    use crate::device::usb::session::DeviceSession;
    use crate::device::usb::stream::{BytesStream, InStream};
    use crate::device::usb::control::{ControlState, TransferOutcome};
    use crate::device::usb::session::DeviceState;
    use crate::device::usb::vcp::{LineCoding, VirtualComPort};

    const CLASS_INTERFACE_OUT: u8 = 0x21;
    const CLASS_INTERFACE_IN: u8 = 0xa1;

    #[test]
    fn enumerates_the_virtual_com_port() {
        let mut host = HostSimulator::new(VirtualComPort::new(8)).unwrap();

        let enumeration = host.enumerate(12).unwrap();

        assert_eq!(enumeration.address, 12);
        assert_eq!(enumeration.device_descriptor.len(), 18);
        assert_eq!(enumeration.configuration_descriptor.len(), 67);
        assert_eq!(enumeration.languages, vec![lang_id::ENGLISH_US]);
        assert_eq!(enumeration.product.as_deref(), Some("HK32 Virtual COM Port"));

        let device = host.device();
        assert_eq!(device.transport().device_address(), 12);
        assert_eq!(device.session().state(), DeviceState::Configured);
        assert_eq!(device.state(), ControlState::Idle);
        assert_eq!(device.last_outcome(), Some(TransferOutcome::Completed));
    }

    #[test]
    fn line_coding_round_trip() {
        let mut host = HostSimulator::new(VirtualComPort::new(8)).unwrap();
        host.enumerate(1).unwrap();

        let coding = LineCoding {
            baud_rate: 57_600,
            char_format: 0,
            parity_type: 2,
            data_bits: 8,
        };

        host.control_out(
            SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_LINE_CODING, 0, 0, 7),
            &coding.to_bytes(),
        )
        .unwrap();

        let read = host
            .control_in(SetupRequest::new(
                CLASS_INTERFACE_IN,
                cdc::GET_LINE_CODING,
                0,
                0,
                7,
            ))
            .unwrap();

        assert_eq!(LineCoding::from_bytes(&read), Some(coding));
        assert_eq!(host.device().class().line_coding(), coding);
    }

    #[test]
    fn unknown_requests_stall_the_data_stage() {
        let mut host = HostSimulator::new(VirtualComPort::default()).unwrap();

        let result = host.control_in(SetupRequest::new(0xc0, 0x42, 0, 0, 4));

        assert_eq!(result, Err(TransferError::Stall(Stage::Data)));

        // The next transfer works again.
        assert_eq!(host.get_configuration(), Ok(0));
    }

    #[test]
    fn rejected_no_data_request_stalls_the_status_stage() {
        let mut host = HostSimulator::new(VirtualComPort::default()).unwrap();

        assert_eq!(
            host.set_configuration(3),
            Err(TransferError::Stall(Stage::Status))
        );
    }

    #[test]
    fn long_descriptors_end_with_a_short_packet() {
        // 64 byte packets: the 67 byte configuration has a short tail.
        let mut host = HostSimulator::new(VirtualComPort::new(64)).unwrap();
        host.device_mut().transport_mut().clear_transmitted();

        let configuration = host
            .get_descriptor(descriptor_type::CONFIGURATION, 0, 255)
            .unwrap();
        assert_eq!(configuration.len(), 67);

        let sizes: Vec<usize> = host
            .device()
            .transport()
            .transmitted()
            .iter()
            .map(|(_, packet)| packet.len())
            .collect();
        assert_eq!(sizes, vec![64, 3]);

        // 32 bytes of a 67 byte descriptor with 8 byte packets: exact
        // request length, no zero-length packet.
        let mut host = HostSimulator::new(VirtualComPort::new(8)).unwrap();
        host.device_mut().transport_mut().clear_transmitted();
        host.get_descriptor(descriptor_type::CONFIGURATION, 0, 32)
            .unwrap();
        assert_eq!(host.device().transport().transmitted().len(), 4);
    }

    #[test]
    fn short_line_coding_is_refused() {
        let mut host = HostSimulator::new(VirtualComPort::new(8)).unwrap();
        host.enumerate(1).unwrap();

        assert_eq!(
            host.control_out(
                SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_LINE_CODING, 0, 0, 3),
                &[0x80, 0x25, 0x00],
            ),
            Err(TransferError::Stall(Stage::Data))
        );
        assert_eq!(host.device().class().line_coding(), LineCoding::default());
    }

    #[test]
    fn bos_is_served_when_present() {
        let port = VirtualComPort::new(8).with_bos(&BosDescriptor { lpm: true });
        let mut host = HostSimulator::new(port).unwrap();

        let bos = host
            .get_descriptor(descriptor_type::DEVICE_BOS, 0, 255)
            .unwrap();
        assert_eq!(bos.len(), 12);
        assert_eq!(&bos[..2], &[5, descriptor_type::DEVICE_BOS]);

        // The header alone, as a host reads it first.
        let header = host
            .get_descriptor(descriptor_type::DEVICE_BOS, 0, 5)
            .unwrap();
        assert_eq!(header, bos[..5].to_vec());
    }

    #[test]
    fn missing_bos_stalls() {
        let mut host = HostSimulator::new(VirtualComPort::new(8)).unwrap();

        assert_eq!(
            host.get_descriptor(descriptor_type::DEVICE_BOS, 0, 5),
            Err(TransferError::Stall(Stage::Data))
        );
    }

    #[test]
    fn endpoint_zero_packet_size_is_validated() {
        for size in [0, 12, 128] {
            assert_eq!(
                HostSimulator::new(VirtualComPort::new(size)).err(),
                Some(PropertiesError::InvalidMaxPacketSize(u16::from(size)))
            );
        }

        for size in [8, 16, 32, 64] {
            let mut host = HostSimulator::new(VirtualComPort::new(size)).unwrap();
            let configuration = host
                .get_descriptor(descriptor_type::CONFIGURATION, 0, 255)
                .unwrap();
            assert_eq!(configuration.len(), 67);
        }
    }

    #[derive(Debug)]
    struct SlowClass;

    impl StandardHooks for SlowClass {}

    impl UsbClass for SlowClass {
        fn properties(&self) -> DeviceProperties {
            DeviceProperties::default()
        }

        fn data_setup(
            &mut self,
            _setup: &SetupRequest,
            _session: &DeviceSession,
        ) -> Result<DataSetup, RequestError> {
            Err(RequestError::NotReady)
        }

        fn interface_setting(&self, _interface: u8, _alternate: u8) -> Result<(), RequestError> {
            Err(RequestError::Unsupported)
        }

        fn device_descriptor(&self) -> Option<Box<dyn InStream>> {
            None
        }

        fn configuration_descriptor(&self, _index: u8) -> Option<Box<dyn InStream>> {
            None
        }

        fn string_descriptor(&self, _index: u8, _lang_id: u16) -> Option<Box<dyn InStream>> {
            None
        }
    }

    #[test]
    fn paused_transfer_times_out_on_the_host() {
        let mut host = HostSimulator::new(SlowClass).unwrap().with_nak_limit(2);

        assert_eq!(
            host.control_in(SetupRequest::new(0xc0, 0x01, 0, 0, 4)),
            Err(TransferError::Timeout(Stage::Data))
        );
        assert_eq!(host.device().state(), ControlState::Pause);
        assert_eq!(host.device_mut().resume_control_transfer(), Ok(true));
    }

    #[derive(Debug)]
    struct TruncatedClass;

    impl StandardHooks for TruncatedClass {}

    impl UsbClass for TruncatedClass {
        fn properties(&self) -> DeviceProperties {
            DeviceProperties::default()
        }

        fn data_setup(
            &mut self,
            _setup: &SetupRequest,
            _session: &DeviceSession,
        ) -> Result<DataSetup, RequestError> {
            Err(RequestError::Unsupported)
        }

        fn interface_setting(&self, _interface: u8, _alternate: u8) -> Result<(), RequestError> {
            Err(RequestError::Unsupported)
        }

        fn device_descriptor(&self) -> Option<Box<dyn InStream>> {
            // Only the first 8 bytes of a device descriptor.
            Some(BytesStream::from_static(&[8, 1, 0x00, 0x02, 0, 0, 0, 64]).boxed())
        }

        fn configuration_descriptor(&self, _index: u8) -> Option<Box<dyn InStream>> {
            None
        }

        fn string_descriptor(&self, _index: u8, _lang_id: u16) -> Option<Box<dyn InStream>> {
            None
        }
    }

    #[test]
    fn truncated_device_descriptor_fails_enumeration() {
        let mut host = HostSimulator::new(TruncatedClass).unwrap();

        assert_eq!(
            host.enumerate(5),
            Err(TransferError::ShortData {
                expected: 18,
                received: 8,
            })
        );
        // The address was already assigned when the short read happened.
        assert_eq!(host.device().transport().device_address(), 5);
    }
}
