//! # Endpoint Transport
//!
//! The control-transfer engine never touches endpoint registers or packet
//! memory directly. Everything it needs from the USB peripheral goes through
//! the [`EndpointTransport`] trait: copying packets in and out of packet
//! memory, switching endpoint handshake status and programming the device
//! address.
//!
//! [`MemoryTransport`] is a complete in-memory implementation. It behaves
//! like the peripheral as far as the engine can observe and additionally
//! offers a host-side API, so a simulated host can exchange packets with it.

use std::fmt::Debug;

use tracing::{debug, trace, warn};

/// The handshake status of one direction of an endpoint.
///
/// The encoding follows the `STAT_RX`/`STAT_TX` fields of the endpoint
/// registers: `Disabled` is 0, any other value means the direction is
/// enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EndpointStatus {
    /// The direction ignores all tokens.
    #[default]
    Disabled = 0,
    /// Every token is answered with STALL.
    Stall = 1,
    /// Every token is answered with NAK.
    Nak = 2,
    /// The next token is answered with data or ACK.
    Valid = 3,
}

impl EndpointStatus {
    /// Returns true if the direction takes part in transfers at all.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Access to endpoint registers and packet memory.
///
/// Endpoints are addressed by their number (0..=15). Unknown endpoint
/// numbers must be ignored for writes and read as [`EndpointStatus::Disabled`].
pub trait EndpointTransport: Debug {
    /// Copy the last packet received on `endpoint` into `data`.
    ///
    /// Returns the number of bytes the packet contained. At most
    /// `data.len()` bytes are copied.
    fn read_packet(&mut self, endpoint: u8, data: &mut [u8]) -> usize;

    /// Place `data` in the transmit buffer of `endpoint`.
    ///
    /// This does not arm the endpoint, use [`set_tx_status`] for that.
    ///
    /// [`set_tx_status`]: EndpointTransport::set_tx_status
    fn write_packet(&mut self, endpoint: u8, data: &[u8]);

    /// Read the receive status of `endpoint`.
    fn rx_status(&self, endpoint: u8) -> EndpointStatus;

    /// Read the transmit status of `endpoint`.
    fn tx_status(&self, endpoint: u8) -> EndpointStatus;

    /// Change the receive status of `endpoint`.
    fn set_rx_status(&mut self, endpoint: u8, status: EndpointStatus);

    /// Change the transmit status of `endpoint`.
    fn set_tx_status(&mut self, endpoint: u8, status: EndpointStatus);

    /// Set the number of bytes `endpoint` accepts for the next packet.
    fn set_rx_count(&mut self, endpoint: u8, count: u16);

    /// Reset the receive data toggle of `endpoint` to DATA0.
    fn clear_rx_toggle(&mut self, endpoint: u8);

    /// Reset the transmit data toggle of `endpoint` to DATA0.
    fn clear_tx_toggle(&mut self, endpoint: u8);

    /// Program the address the device answers to on the bus.
    fn set_device_address(&mut self, address: u8);

    /// Queue a zero-length packet on `endpoint` and arm it.
    fn send_zero_length(&mut self, endpoint: u8) {
        self.write_packet(endpoint, &[]);
        self.set_tx_status(endpoint, EndpointStatus::Valid);
    }

    /// Returns true if the receive direction of `endpoint` is halted.
    #[must_use]
    fn is_rx_stalled(&self, endpoint: u8) -> bool {
        self.rx_status(endpoint) == EndpointStatus::Stall
    }

    /// Returns true if the transmit direction of `endpoint` is halted.
    #[must_use]
    fn is_tx_stalled(&self, endpoint: u8) -> bool {
        self.tx_status(endpoint) == EndpointStatus::Stall
    }
}

/// The answer a device gives to a host token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// The transaction completed.
    Ack,
    /// The device is busy, the host retries later.
    Nak,
    /// The endpoint is halted or the request was rejected.
    Stall,
    /// The endpoint does not exist or is disabled; the token times out.
    NoResponse,
}

/// Register and buffer state of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointRegisters {
    /// `STAT_RX`.
    pub rx_status: EndpointStatus,
    /// `STAT_TX`.
    pub tx_status: EndpointStatus,
    /// The number of bytes accepted for the next OUT/SETUP packet.
    pub rx_count: u16,
    /// `DTOG_RX`, `true` means DATA1.
    pub rx_toggle: bool,
    /// `DTOG_TX`, `true` means DATA1.
    pub tx_toggle: bool,
    /// The last packet received.
    pub rx_buffer: Vec<u8>,
    /// The packet waiting for the next IN token.
    pub tx_buffer: Vec<u8>,
}

/// An in-memory USB peripheral.
///
/// The device side uses the [`EndpointTransport`] implementation. The host
/// side uses [`receive_setup`](Self::receive_setup),
/// [`receive_out`](Self::receive_out) and
/// [`transmit_in`](Self::transmit_in) to play the role of the bus.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    endpoints: Vec<EndpointRegisters>,
    address: u8,
    /// Every packet the device handed to the bus, as (endpoint, payload).
    transmitted: Vec<(u8, Vec<u8>)>,
}

impl MemoryTransport {
    /// Create a peripheral with `endpoint_count` endpoints, all disabled.
    #[must_use]
    pub fn new(endpoint_count: usize) -> Self {
        assert!(
            (1..=16).contains(&endpoint_count),
            "endpoint count must be 1..=16"
        );

        Self {
            endpoints: vec![EndpointRegisters::default(); endpoint_count],
            address: 0,
            transmitted: Vec::new(),
        }
    }

    /// The address the device currently answers to.
    #[must_use]
    pub const fn device_address(&self) -> u8 {
        self.address
    }

    /// Inspect the registers of `endpoint`.
    #[must_use]
    pub fn endpoint(&self, endpoint: u8) -> Option<&EndpointRegisters> {
        self.endpoints.get(usize::from(endpoint))
    }

    /// All packets the device transmitted so far.
    #[must_use]
    pub fn transmitted(&self) -> &[(u8, Vec<u8>)] {
        &self.transmitted
    }

    /// Forget the transmit log.
    pub fn clear_transmitted(&mut self) {
        self.transmitted.clear();
    }

    /// Deliver a SETUP packet to endpoint 0.
    ///
    /// Like the hardware, SETUP packets are accepted regardless of the
    /// endpoint status. Both directions go to NAK and the data toggles
    /// prepare for a DATA1 data or status stage.
    pub fn receive_setup(&mut self, setup: &[u8]) {
        let ep0 = &mut self.endpoints[0];

        ep0.rx_buffer = setup.to_vec();
        ep0.rx_status = EndpointStatus::Nak;
        ep0.tx_status = EndpointStatus::Nak;
        ep0.rx_toggle = true;
        ep0.tx_toggle = true;

        trace!("received SETUP {:02x?}", setup);
    }

    /// Deliver an OUT data packet to `endpoint`.
    ///
    /// The packet is only stored if the endpoint is armed for reception.
    pub fn receive_out(&mut self, endpoint: u8, data: &[u8]) -> Handshake {
        let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) else {
            return Handshake::NoResponse;
        };

        match ep.rx_status {
            EndpointStatus::Valid => {
                if data.len() > usize::from(ep.rx_count) {
                    warn!(
                        "EP{} received {} bytes, but only {} were armed",
                        endpoint,
                        data.len(),
                        ep.rx_count
                    );
                }
                ep.rx_buffer = data.to_vec();
                ep.rx_status = EndpointStatus::Nak;
                ep.rx_toggle = !ep.rx_toggle;
                trace!("EP{} received OUT {:02x?}", endpoint, data);
                Handshake::Ack
            }
            EndpointStatus::Nak => Handshake::Nak,
            EndpointStatus::Stall => Handshake::Stall,
            EndpointStatus::Disabled => Handshake::NoResponse,
        }
    }

    /// Answer an IN token on `endpoint`.
    ///
    /// Returns the packet if the endpoint was armed for transmission,
    /// otherwise the handshake the device answered with.
    pub fn transmit_in(&mut self, endpoint: u8) -> Result<Vec<u8>, Handshake> {
        let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) else {
            return Err(Handshake::NoResponse);
        };

        match ep.tx_status {
            EndpointStatus::Valid => {
                let data = std::mem::take(&mut ep.tx_buffer);
                ep.tx_status = EndpointStatus::Nak;
                ep.tx_toggle = !ep.tx_toggle;
                trace!("EP{} transmitted IN {:02x?}", endpoint, data);
                self.transmitted.push((endpoint, data.clone()));
                Ok(data)
            }
            EndpointStatus::Nak => Err(Handshake::Nak),
            EndpointStatus::Stall => Err(Handshake::Stall),
            EndpointStatus::Disabled => Err(Handshake::NoResponse),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(8)
    }
}

impl EndpointTransport for MemoryTransport {
    fn read_packet(&mut self, endpoint: u8, data: &mut [u8]) -> usize {
        let Some(ep) = self.endpoints.get(usize::from(endpoint)) else {
            return 0;
        };

        let count = ep.rx_buffer.len().min(data.len());
        data[..count].copy_from_slice(&ep.rx_buffer[..count]);

        ep.rx_buffer.len()
    }

    fn write_packet(&mut self, endpoint: u8, data: &[u8]) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.tx_buffer = data.to_vec();
        }
    }

    fn rx_status(&self, endpoint: u8) -> EndpointStatus {
        self.endpoint(endpoint)
            .map_or(EndpointStatus::Disabled, |ep| ep.rx_status)
    }

    fn tx_status(&self, endpoint: u8) -> EndpointStatus {
        self.endpoint(endpoint)
            .map_or(EndpointStatus::Disabled, |ep| ep.tx_status)
    }

    fn set_rx_status(&mut self, endpoint: u8, status: EndpointStatus) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.rx_status = status;
        }
    }

    fn set_tx_status(&mut self, endpoint: u8, status: EndpointStatus) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.tx_status = status;
        }
    }

    fn set_rx_count(&mut self, endpoint: u8, count: u16) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.rx_count = count;
        }
    }

    fn clear_rx_toggle(&mut self, endpoint: u8) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.rx_toggle = false;
        }
    }

    fn clear_tx_toggle(&mut self, endpoint: u8) {
        if let Some(ep) = self.endpoints.get_mut(usize::from(endpoint)) {
            ep.tx_toggle = false;
        }
    }

    fn set_device_address(&mut self, address: u8) {
        debug!("device address register set to {}", address);
        self.address = address;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_endpoints_read_as_disabled() {
        let mut transport = MemoryTransport::new(2);

        transport.set_rx_status(5, EndpointStatus::Valid);

        assert_eq!(transport.rx_status(5), EndpointStatus::Disabled);
        assert_eq!(transport.tx_status(5), EndpointStatus::Disabled);
        assert_eq!(transport.receive_out(5, &[1]), Handshake::NoResponse);
    }

    #[test]
    fn out_packets_are_only_accepted_when_armed() {
        let mut transport = MemoryTransport::new(2);
        let mut buf = [0; 4];

        transport.set_rx_status(1, EndpointStatus::Nak);
        assert_eq!(transport.receive_out(1, &[1, 2]), Handshake::Nak);

        transport.set_rx_count(1, 4);
        transport.set_rx_status(1, EndpointStatus::Valid);
        assert_eq!(transport.receive_out(1, &[1, 2]), Handshake::Ack);
        assert_eq!(
            transport.rx_status(1),
            EndpointStatus::Nak,
            "reception disarms the endpoint"
        );

        assert_eq!(transport.read_packet(1, &mut buf), 2);
        assert_eq!(&buf[..2], &[1, 2]);

        transport.set_rx_status(1, EndpointStatus::Stall);
        assert_eq!(transport.receive_out(1, &[3]), Handshake::Stall);
    }

    #[test]
    fn in_tokens_drain_the_armed_packet_once() {
        let mut transport = MemoryTransport::new(1);

        assert_eq!(transport.transmit_in(0), Err(Handshake::NoResponse));

        transport.write_packet(0, &[0xaa, 0xbb]);
        transport.set_tx_status(0, EndpointStatus::Valid);

        assert_eq!(transport.transmit_in(0), Ok(vec![0xaa, 0xbb]));
        assert_eq!(transport.transmit_in(0), Err(Handshake::Nak));
        assert_eq!(transport.transmitted(), &[(0, vec![0xaa, 0xbb])]);
    }

    #[test]
    fn setup_is_accepted_even_when_stalled() {
        let mut transport = MemoryTransport::new(1);
        let mut buf = [0; 8];

        transport.set_rx_status(0, EndpointStatus::Stall);
        transport.set_tx_status(0, EndpointStatus::Stall);
        transport.receive_setup(&[0x80, 6, 0, 1, 0, 0, 18, 0]);

        assert_eq!(transport.read_packet(0, &mut buf), 8);
        assert_eq!(transport.rx_status(0), EndpointStatus::Nak);
        assert_eq!(transport.tx_status(0), EndpointStatus::Nak);
    }

    #[test]
    fn zero_length_packets_are_armed() {
        let mut transport = MemoryTransport::new(1);

        transport.send_zero_length(0);

        assert_eq!(transport.transmit_in(0), Ok(vec![]));
    }
}
