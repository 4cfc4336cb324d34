//! # Control Transfer State Machine
//!
//! Endpoint 0 traffic is processed one hardware event at a time. A SETUP
//! packet starts a transfer, IN and OUT tokens move it through the data
//! stage and the status stage:
//!
//! ```text
//! SETUP, wLength == 0:  SettingUp -> WaitStatusIn -> Idle
//! SETUP, IN data:       SettingUp -> InData* -> LastInData -> WaitStatusOut -> Idle
//! SETUP, OUT data:      SettingUp -> OutData* -> LastOutData -> WaitStatusIn -> Idle
//! ```
//!
//! Any rejected request or illegal token moves the engine to `Stalled`.
//! `Idle` and `Stalled` both stall endpoint 0 in both directions, so only
//! the next SETUP packet gets a response. A handler that needs more time
//! moves the engine to `Pause` until
//! [`resume_control_transfer`](UsbDevice::resume_control_transfer) is
//! called.

use tracing::{debug, trace, warn};

use super::class::{DataSetup, UsbClass};
use super::constants::{request, ENDPOINT0, SETUP_PACKET_SIZE};
use super::device::UsbDevice;
use super::error::{ControlError, RequestError};
use super::setup::{Direction, Recipient, SetupParseError, SetupRequest};
use super::stream::InStream;
use crate::device::transport::{EndpointStatus, EndpointTransport};

/// The phase of the control transfer on endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// No transfer in flight.
    #[default]
    Idle,
    /// A SETUP packet is being processed.
    SettingUp,
    /// More than one packet of IN data is left.
    InData,
    /// The last IN data packet (or the trailing zero-length packet) is out.
    LastInData,
    /// The IN data stage is done, waiting for the host's OUT status packet.
    WaitStatusOut,
    /// More than one packet of OUT data is expected.
    OutData,
    /// Less than a full packet of OUT data is expected.
    LastOutData,
    /// The device queued its zero-length IN status packet.
    WaitStatusIn,
    /// The transfer was rejected.
    Stalled,
    /// A handler is not ready, the transfer waits for an explicit resume.
    Pause,
}

/// A hardware event on endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ep0Event {
    /// A SETUP packet was received.
    Setup,
    /// An IN packet was sent to the host.
    In,
    /// An OUT packet was received.
    Out,
}

/// How the last control transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The status stage completed.
    Completed,
    /// The transfer was stalled.
    Stalled(ControlError),
}

/// Where the bytes of the data stage come from or go to.
#[derive(Debug, Default)]
pub(super) enum DataStage {
    #[default]
    None,
    In(Box<dyn InStream>),
    Out,
}

/// The cursor of the active data stage.
#[derive(Debug, Default)]
pub(super) struct ControlInfo {
    /// Bytes left to send or receive.
    pub(super) remaining: usize,
    /// Bytes sent or received so far.
    pub(super) offset: usize,
    /// The size of a full data packet.
    pub(super) packet_size: usize,
    /// A zero-length packet has to follow the last full packet.
    pub(super) zero_length_pending: bool,
    pub(super) data: DataStage,
}

/// Decide whether a control read needs a trailing zero-length packet.
///
/// The host stops reading at a short packet or after `requested` bytes. If
/// the device has less than that and it ends on a packet boundary, only a
/// zero-length packet tells the host that nothing else follows.
pub(super) const fn needs_zero_length_packet(
    available: usize,
    requested: usize,
    packet_size: usize,
) -> bool {
    available < requested && available >= packet_size && available % packet_size == 0
}

impl<C: UsbClass, T: EndpointTransport> UsbDevice<C, T> {
    /// Process a SETUP packet on endpoint 0.
    ///
    /// The packet always starts a new transfer, whatever state the previous
    /// one was in. Returns true if the transfer is paused.
    pub fn setup0(&mut self) -> bool {
        let mut packet = [0; SETUP_PACKET_SIZE];
        let received = self.transport.read_packet(ENDPOINT0, &mut packet);

        if self.state != ControlState::Idle {
            trace!("SETUP supersedes control transfer in state {:?}", self.state);
        }

        self.state = ControlState::SettingUp;
        self.ctrl = ControlInfo::default();
        self.last_outcome = None;

        if received == SETUP_PACKET_SIZE {
            self.request = SetupRequest::from_bytes(&packet);
            debug!("SETUP {}", self.request);
            self.process_setup();
        } else {
            self.stall(SetupParseError(received).into());
        }

        self.post0()
    }

    /// Process the completion of an IN packet on endpoint 0.
    ///
    /// Returns true if the transfer is paused.
    pub fn in0(&mut self) -> bool {
        match self.state {
            ControlState::InData | ControlState::LastInData => self.data_stage_in(),
            ControlState::WaitStatusIn => {
                if self.request.request == request::SET_ADDRESS
                    && self.request.is_standard_for(Recipient::Device)
                {
                    // The new address must only apply after the status stage.
                    let address = self.request.value_low();
                    self.transport.set_device_address(address);
                    self.session.commit_address(address);
                    self.class.on_set_device_address(&self.session);
                }

                self.class.status_in();
                self.complete();
            }
            state => self.stall(ControlError::ProtocolViolation {
                state,
                event: Ep0Event::In,
            }),
        }

        self.post0()
    }

    /// Process the reception of an OUT packet on endpoint 0.
    ///
    /// Returns true if the transfer is paused.
    pub fn out0(&mut self) -> bool {
        match self.state {
            ControlState::InData | ControlState::LastInData => {
                // The host aborted the IN data stage early.
                self.stall(ControlError::ProtocolViolation {
                    state: self.state,
                    event: Ep0Event::Out,
                })
            }
            ControlState::OutData | ControlState::LastOutData => self.data_stage_out(),
            ControlState::WaitStatusOut => {
                self.class.status_out();
                self.complete();
            }
            state => self.stall(ControlError::ProtocolViolation {
                state,
                event: Ep0Event::Out,
            }),
        }

        self.post0()
    }

    /// Prepare endpoint 0 for the next event.
    ///
    /// Re-arms the receive buffer for a full packet and stalls both
    /// directions if no transfer is in flight anymore. Returns true if the
    /// transfer is paused, in which case nothing happens on endpoint 0
    /// until it is resumed.
    pub fn post0(&mut self) -> bool {
        self.transport
            .set_rx_count(ENDPOINT0, self.properties.max_packet_size);

        if matches!(self.state, ControlState::Stalled | ControlState::Idle) {
            self.transport.set_rx_status(ENDPOINT0, EndpointStatus::Stall);
            self.transport.set_tx_status(ENDPOINT0, EndpointStatus::Stall);
        }

        self.state == ControlState::Pause
    }

    /// Continue a transfer that was paused because its data was not ready.
    ///
    /// The class calls this once it can serve the request. The stored
    /// request is dispatched again from the start. Returns true if the
    /// transfer is still paused.
    pub fn resume_control_transfer(&mut self) -> Result<bool, ControlError> {
        if self.state != ControlState::Pause {
            return Err(ControlError::NotPaused);
        }

        debug!("resuming control transfer {}", self.request);

        self.state = ControlState::SettingUp;
        self.ctrl = ControlInfo::default();
        self.process_setup();

        Ok(self.post0())
    }

    fn process_setup(&mut self) {
        if self.request.has_no_data() {
            self.no_data_setup0();
        } else {
            self.data_setup0();
        }
    }

    fn no_data_setup0(&mut self) {
        let setup = self.request;

        let result = if setup.request == request::SET_ADDRESS
            && setup.is_standard_for(Recipient::Device)
        {
            // A rejected address is final, the class never sees it.
            self.standard_set_address()
        } else {
            self.standard_no_data_request()
                .or_else(|_| self.class.no_data_setup(&setup, &self.session))
        };

        match result {
            Ok(()) => {
                self.state = ControlState::WaitStatusIn;
                self.transport.send_zero_length(ENDPOINT0);
            }
            Err(RequestError::NotReady) => self.pause(),
            Err(error) => self.stall(error.into()),
        }
    }

    fn data_setup0(&mut self) {
        let setup = self.request;

        let stage = match self.standard_data_request() {
            Some(stream) => Ok(DataSetup::In(stream)),
            None => self.class.data_setup(&setup, &self.session),
        };

        let stage = match stage {
            Ok(stage) => stage,
            Err(RequestError::NotReady) => return self.pause(),
            Err(error) => return self.stall(error.into()),
        };

        let packet_size = usize::from(self.properties.max_packet_size);
        self.ctrl.packet_size = packet_size;

        match (stage, setup.direction()) {
            (DataSetup::In(stream), Direction::DeviceToHost) => {
                let Some(available) = stream.total_len() else {
                    return self.pause();
                };
                if available == 0 {
                    return self.stall(RequestError::Unsupported.into());
                }

                // The host-requested length only caps the transfer.
                let requested = usize::from(setup.length);
                self.ctrl.remaining = available.min(requested);
                self.ctrl.zero_length_pending =
                    needs_zero_length_packet(available, requested, packet_size);
                self.ctrl.data = DataStage::In(stream);

                trace!(
                    "IN data stage of {} bytes (zero-length packet: {})",
                    self.ctrl.remaining,
                    self.ctrl.zero_length_pending
                );

                self.data_stage_in();
            }
            (DataSetup::Out(length), Direction::HostToDevice) if length > 0 => {
                if length > usize::from(setup.length) {
                    warn!(
                        "handler expects {} bytes, host only sends {}, stalling",
                        length, setup.length
                    );
                    return self.stall(RequestError::Unsupported.into());
                }

                self.ctrl.remaining = length;
                self.ctrl.data = DataStage::Out;
                self.state = ControlState::OutData;

                trace!("OUT data stage of {} bytes", length);

                self.transport
                    .set_rx_status(ENDPOINT0, EndpointStatus::Valid);
            }
            (stage, direction) => {
                warn!(
                    "handler answered {:?} request with {:?}, stalling",
                    direction, stage
                );
                self.stall(RequestError::Unsupported.into());
            }
        }
    }

    /// Queue the next packet of an IN data stage.
    fn data_stage_in(&mut self) {
        let remaining = self.ctrl.remaining;

        if remaining == 0 && self.state == ControlState::LastInData {
            if self.ctrl.zero_length_pending {
                trace!("sending zero-length packet to end the data stage");
                self.ctrl.zero_length_pending = false;
                self.transport.send_zero_length(ENDPOINT0);
            } else {
                self.state = ControlState::WaitStatusOut;
                self.transport.set_tx_status(ENDPOINT0, EndpointStatus::Stall);
            }
            return;
        }

        let packet_size = self.ctrl.packet_size;
        let length = remaining.min(packet_size);
        let offset = self.ctrl.offset;

        let DataStage::In(stream) = &mut self.ctrl.data else {
            return self.stall(ControlError::ProtocolViolation {
                state: self.state,
                event: Ep0Event::In,
            });
        };

        let chunk = stream.next_chunk(offset, length);
        if chunk.len() != length {
            warn!(
                "data stage provider returned {} bytes at offset {}, expected {}",
                chunk.len(),
                offset,
                length
            );
        }
        self.transport.write_packet(ENDPOINT0, chunk);

        self.state = if remaining <= packet_size {
            ControlState::LastInData
        } else {
            ControlState::InData
        };
        self.ctrl.remaining -= length;
        self.ctrl.offset += length;

        self.transport.set_tx_status(ENDPOINT0, EndpointStatus::Valid);
        // Allow the host to end the data stage early with its status packet.
        self.transport.set_rx_status(ENDPOINT0, EndpointStatus::Valid);
    }

    /// Consume the next packet of an OUT data stage.
    fn data_stage_out(&mut self) {
        let packet_size = self.ctrl.packet_size;

        if matches!(self.ctrl.data, DataStage::Out) && self.ctrl.remaining > 0 {
            let length = self.ctrl.remaining.min(packet_size);
            let mut buffer = vec![0; length];
            let received = self.transport.read_packet(ENDPOINT0, &mut buffer);

            if received != length {
                warn!(
                    "OUT data packet has {} bytes, expected {}",
                    received, length
                );
            }

            self.class
                .data_out(self.ctrl.offset, &buffer[..received.min(length)]);
            self.ctrl.remaining -= length;
            self.ctrl.offset += length;
        }

        if self.ctrl.remaining != 0 {
            self.transport
                .set_rx_status(ENDPOINT0, EndpointStatus::Valid);
            // Allow the host to end the data stage early with its status packet.
            self.transport.send_zero_length(ENDPOINT0);
        }

        if self.ctrl.remaining >= packet_size {
            self.state = ControlState::OutData;
        } else if self.ctrl.remaining > 0 {
            self.state = ControlState::LastOutData;
        } else {
            self.state = ControlState::WaitStatusIn;
            self.transport.send_zero_length(ENDPOINT0);
        }
    }

    fn pause(&mut self) {
        debug!("pausing control transfer {}", self.request);
        self.state = ControlState::Pause;
    }

    fn stall(&mut self, error: ControlError) {
        debug!("stalling control transfer {}: {}", self.request, error);
        self.state = ControlState::Stalled;
        self.last_outcome = Some(TransferOutcome::Stalled(error));
    }

    fn complete(&mut self) {
        trace!("control transfer {} completed", self.request);
        self.state = ControlState::Idle;
        self.ctrl = ControlInfo::default();
        self.last_outcome = Some(TransferOutcome::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_length_packet_rule() {
        // 18-byte device descriptor, host asks for 64: short packet ends it.
        assert!(!needs_zero_length_packet(18, 64, 8));
        // 64-byte configuration, host asks for 255: needs the marker.
        assert!(needs_zero_length_packet(64, 255, 64));
        assert!(needs_zero_length_packet(32, 255, 8));
        // The host asked for exactly this much.
        assert!(!needs_zero_length_packet(64, 64, 64));
        // Less than one packet is always short.
        assert!(!needs_zero_length_packet(4, 255, 8));
    }

    proptest! {
        #[test]
        fn zero_length_packet_only_on_boundaries(
            available in 1usize..1024,
            requested in 1usize..1024,
            packet_size in prop_oneof![Just(8usize), Just(16), Just(32), Just(64)],
        ) {
            let zlp = needs_zero_length_packet(available, requested, packet_size);
            let sent = available.min(requested);

            if zlp {
                prop_assert_eq!(sent % packet_size, 0);
                prop_assert!(sent < requested);
            } else {
                prop_assert!(sent % packet_size != 0 || sent == requested);
            }
        }
    }
}
