//! # Class Dispatch Interface
//!
//! The control-transfer engine only knows chapter 9. Everything else comes
//! from a [`UsbClass`] implementation: descriptors, class and vendor
//! requests, interface setting validation and the hooks that run when a
//! status stage completes.

use std::fmt::Debug;

use super::error::{PropertiesError, RequestError};
use super::session::DeviceSession;
use super::setup::SetupRequest;
use super::stream::InStream;
use crate::device::transport::EndpointTransport;

/// The static properties of a device that the engine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// The max packet size of endpoint 0 (8, 16, 32 or 64 for full speed).
    pub max_packet_size: u16,
    /// The number of endpoints including endpoint 0.
    pub total_endpoints: u8,
    /// The number of configurations the device descriptor advertises.
    pub total_configurations: u8,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            max_packet_size: 64,
            total_endpoints: 1,
            total_configurations: 1,
        }
    }
}

impl DeviceProperties {
    /// Check that endpoint 0 can be driven with these properties.
    pub const fn validate(&self) -> Result<(), PropertiesError> {
        match self.max_packet_size {
            8 | 16 | 32 | 64 => Ok(()),
            size => Err(PropertiesError::InvalidMaxPacketSize(size)),
        }
    }
}

/// How a class accepted a request with a data stage.
#[derive(Debug)]
pub enum DataSetup {
    /// Send the stream to the host. The engine caps it at `wLength`.
    In(Box<dyn InStream>),
    /// Receive this many bytes from the host through [`UsbClass::data_out`].
    Out(usize),
}

/// Notifications after a standard request succeeded.
///
/// They are meant for application side effects, e.g. enabling endpoints
/// once the device is configured. All of them default to doing nothing.
pub trait StandardHooks {
    /// GET_CONFIGURATION is about to return the configuration.
    fn on_get_configuration(&mut self, _session: &DeviceSession) {}

    /// SET_CONFIGURATION selected `session.configuration()`.
    fn on_set_configuration(
        &mut self,
        _session: &DeviceSession,
        _transport: &mut dyn EndpointTransport,
    ) {
    }

    /// GET_INTERFACE is about to return the alternate setting.
    fn on_get_interface(&mut self, _session: &DeviceSession) {}

    /// SET_INTERFACE was accepted. The session still holds the previous
    /// interface and alternate setting.
    fn on_set_interface(&mut self, _session: &DeviceSession, _interface: u8, _alternate: u8) {}

    /// GET_STATUS is about to return a status word.
    fn on_get_status(&mut self, _session: &DeviceSession) {}

    /// CLEAR_FEATURE(ENDPOINT_HALT) cleared a halt.
    fn on_clear_feature(&mut self, _session: &DeviceSession) {}

    /// SET_FEATURE(ENDPOINT_HALT) halted an endpoint.
    fn on_set_endpoint_feature(&mut self, _session: &DeviceSession) {}

    /// SET_FEATURE(DEVICE_REMOTE_WAKEUP) enabled remote wakeup.
    fn on_set_device_feature(&mut self, _session: &DeviceSession) {}

    /// The address from SET_ADDRESS took effect.
    fn on_set_device_address(&mut self, _session: &DeviceSession) {}
}

/// A device class plugged into the control-transfer engine.
pub trait UsbClass: StandardHooks + Debug {
    /// The properties the engine works with.
    fn properties(&self) -> DeviceProperties;

    /// `bmAttributes` of the configuration descriptor.
    ///
    /// Bit 6 (self powered) seeds the device status after a bus reset.
    #[must_use]
    fn configuration_attributes(&self) -> u8 {
        0x80
    }

    /// Called once when the device is powered up.
    fn init(&mut self, _transport: &mut dyn EndpointTransport) {}

    /// Called on every bus reset after endpoint 0 is set up again.
    ///
    /// Classes arm their other endpoints here.
    fn reset(&mut self, _transport: &mut dyn EndpointTransport) {}

    /// Handle a class or vendor request with a data stage.
    fn data_setup(
        &mut self,
        _setup: &SetupRequest,
        _session: &DeviceSession,
    ) -> Result<DataSetup, RequestError> {
        Err(RequestError::Unsupported)
    }

    /// Handle a request without data stage that chapter 9 does not cover.
    fn no_data_setup(
        &mut self,
        _setup: &SetupRequest,
        _session: &DeviceSession,
    ) -> Result<(), RequestError> {
        Err(RequestError::Unsupported)
    }

    /// Check whether `interface` exists with `alternate_setting`.
    fn interface_setting(&self, interface: u8, alternate_setting: u8) -> Result<(), RequestError>;

    /// Receive the next chunk of an OUT data stage accepted with
    /// [`DataSetup::Out`].
    fn data_out(&mut self, _offset: usize, _data: &[u8]) {}

    /// The device descriptor.
    fn device_descriptor(&self) -> Option<Box<dyn InStream>>;

    /// The configuration descriptor with `index`, including all interface
    /// and endpoint descriptors.
    fn configuration_descriptor(&self, index: u8) -> Option<Box<dyn InStream>>;

    /// The string descriptor with `index` in language `lang_id`.
    fn string_descriptor(&self, index: u8, lang_id: u16) -> Option<Box<dyn InStream>>;

    /// The binary device object store, for devices that support LPM.
    #[must_use]
    fn bos_descriptor(&self) -> Option<Box<dyn InStream>> {
        None
    }

    /// The IN status stage of a control write or no-data transfer completed.
    ///
    /// Data received during an OUT data stage is complete at this point.
    fn status_in(&mut self) {}

    /// The OUT status stage of a control read completed.
    fn status_out(&mut self) {}
}
