//! # USB Device
//!
//! [`UsbDevice`] ties a [`UsbClass`] to an [`EndpointTransport`] and owns
//! everything a control transfer needs between two hardware events. The
//! endpoint 0 entry points live in the [`control`](super::control) module,
//! next to the chapter 9 request handlers.

use tracing::{debug, info, warn};

use super::class::{DeviceProperties, UsbClass};
use super::constants::ENDPOINT0;
use super::control::{ControlInfo, ControlState, Ep0Event, TransferOutcome};
use super::error::PropertiesError;
use super::session::{DeviceSession, DeviceState};
use super::setup::SetupRequest;
use crate::device::transport::{EndpointStatus, EndpointTransport};

/// A USB full-speed device.
///
/// The hardware interrupt handler forwards endpoint 0 events with
/// [`handle_ep0_event`](Self::handle_ep0_event) and bus events with
/// [`bus_reset`](Self::bus_reset), [`suspend`](Self::suspend) and
/// [`resume_bus`](Self::resume_bus).
#[derive(Debug)]
pub struct UsbDevice<C, T> {
    pub(super) class: C,
    pub(super) transport: T,
    pub(super) properties: DeviceProperties,
    pub(super) session: DeviceSession,
    pub(super) state: ControlState,
    /// The request of the transfer in flight (or the last one).
    pub(super) request: SetupRequest,
    pub(super) ctrl: ControlInfo,
    pub(super) last_outcome: Option<TransferOutcome>,
}

impl<C: UsbClass, T: EndpointTransport> UsbDevice<C, T> {
    /// Create a device. The properties are taken from `class` once.
    ///
    /// Fails if the endpoint 0 max packet size is not one a full-speed
    /// device may use.
    pub fn new(class: C, transport: T) -> Result<Self, PropertiesError> {
        let properties = class.properties();

        if let Err(error) = properties.validate() {
            warn!("refusing to create USB device: {}", error);
            return Err(error);
        }

        debug!(
            "new USB device: EP0 max packet size {}, {} endpoints, {} configurations",
            properties.max_packet_size, properties.total_endpoints, properties.total_configurations
        );

        Ok(Self {
            class,
            transport,
            properties,
            session: DeviceSession::default(),
            state: ControlState::default(),
            request: SetupRequest::default(),
            ctrl: ControlInfo::default(),
            last_outcome: None,
        })
    }

    /// Power up the device and let the class initialize its endpoints.
    pub fn power_on(&mut self) {
        self.class.init(&mut self.transport);
        self.session.set_state(DeviceState::Powered);
    }

    /// Handle a bus reset.
    ///
    /// Everything the host negotiated is forgotten, the device answers at
    /// address 0 and endpoint 0 waits for a SETUP packet.
    pub fn bus_reset(&mut self) {
        info!("USB bus reset");

        self.state = ControlState::Idle;
        self.ctrl = ControlInfo::default();
        self.last_outcome = None;
        self.session.reset(self.class.configuration_attributes());

        self.transport.set_device_address(0);
        self.transport
            .set_rx_count(ENDPOINT0, self.properties.max_packet_size);
        self.transport.set_rx_status(ENDPOINT0, EndpointStatus::Valid);
        self.transport.set_tx_status(ENDPOINT0, EndpointStatus::Stall);

        self.class.reset(&mut self.transport);
    }

    /// The bus went idle.
    pub fn suspend(&mut self) {
        self.session.suspend();
    }

    /// The bus resumed after a suspend.
    pub fn resume_bus(&mut self) {
        self.session.wake_up();
    }

    /// Dispatch a correct-transfer event of endpoint 0.
    ///
    /// Returns true if the control transfer is paused.
    pub fn handle_ep0_event(&mut self, event: Ep0Event) -> bool {
        match event {
            Ep0Event::Setup => self.setup0(),
            Ep0Event::In => self.in0(),
            Ep0Event::Out => self.out0(),
        }
    }

    /// The phase of the control transfer.
    #[must_use]
    pub const fn state(&self) -> ControlState {
        self.state
    }

    /// How the last control transfer ended, `None` while one is in flight.
    #[must_use]
    pub const fn last_outcome(&self) -> Option<TransferOutcome> {
        self.last_outcome
    }

    /// The last SETUP request.
    #[must_use]
    pub const fn request(&self) -> &SetupRequest {
        &self.request
    }

    /// The state the host negotiated with the device.
    #[must_use]
    pub const fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// The properties taken from the class.
    #[must_use]
    pub const fn properties(&self) -> DeviceProperties {
        self.properties
    }

    /// The device class.
    #[must_use]
    pub const fn class(&self) -> &C {
        &self.class
    }

    /// The device class.
    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    /// The endpoint transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The endpoint transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
