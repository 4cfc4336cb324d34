//! # Standard Requests
//!
//! The chapter 9 requests every device has to answer. Each handler checks
//! the reserved fields and the device state before touching anything; a
//! rejected request is offered to the class afterwards (except
//! SET_ADDRESS), so classes can extend the standard set.

use tracing::{debug, trace};

use super::class::UsbClass;
use super::constants::{
    current_feature, descriptor_type, endpoint_index, feature, request, status, ENDPOINT0,
    MAX_DEVICE_ADDRESS,
};
use super::device::UsbDevice;
use super::error::RequestError;
use super::setup::Recipient;
use super::stream::{BytesStream, InStream};
use crate::device::transport::{EndpointStatus, EndpointTransport};

/// The endpoint a `wIndex` low byte points at, without the direction bit.
const fn endpoint_number(index_low: u8) -> u8 {
    index_low & !endpoint_index::DIRECTION_IN
}

const fn is_in_endpoint(index_low: u8) -> bool {
    index_low & endpoint_index::DIRECTION_IN != 0
}

impl<C: UsbClass, T: EndpointTransport> UsbDevice<C, T> {
    /// The status of the direction of an endpoint that `index_low` selects.
    fn endpoint_status(&self, index_low: u8) -> EndpointStatus {
        let endpoint = endpoint_number(index_low);

        if is_in_endpoint(index_low) {
            self.transport.tx_status(endpoint)
        } else {
            self.transport.rx_status(endpoint)
        }
    }

    /// Dispatch a standard request without data stage.
    ///
    /// SET_ADDRESS is not handled here, see
    /// [`standard_set_address`](Self::standard_set_address).
    pub(super) fn standard_no_data_request(&mut self) -> Result<(), RequestError> {
        let setup = self.request;

        match setup.recipient() {
            Recipient::Device if setup.is_standard_for(Recipient::Device) => {
                match setup.request {
                    request::SET_CONFIGURATION => self.standard_set_configuration(),
                    request::SET_FEATURE => self.standard_set_device_feature(),
                    request::CLEAR_FEATURE => self.standard_clear_device_feature(),
                    _ => Err(RequestError::Unsupported),
                }
            }
            Recipient::Interface if setup.is_standard_for(Recipient::Interface) => {
                match setup.request {
                    request::SET_INTERFACE => self.standard_set_interface(),
                    _ => Err(RequestError::Unsupported),
                }
            }
            Recipient::Endpoint if setup.is_standard_for(Recipient::Endpoint) => {
                match setup.request {
                    request::CLEAR_FEATURE => self.standard_clear_endpoint_feature(),
                    request::SET_FEATURE => self.standard_set_endpoint_feature(),
                    _ => Err(RequestError::Unsupported),
                }
            }
            _ => Err(RequestError::Unsupported),
        }
    }

    /// Check a SET_ADDRESS request.
    ///
    /// The address is only recorded in the request; it is committed when
    /// the status stage completes.
    pub(super) fn standard_set_address(&self) -> Result<(), RequestError> {
        let setup = self.request;

        if setup.value_low() > MAX_DEVICE_ADDRESS
            || setup.value_high() != 0
            || setup.index != 0
            || self.session.is_configured()
        {
            debug!("rejecting SET_ADDRESS {}", setup.value);
            return Err(RequestError::Unsupported);
        }

        trace!("SET_ADDRESS {} deferred to the status stage", setup.value_low());
        Ok(())
    }

    fn standard_set_configuration(&mut self) -> Result<(), RequestError> {
        let setup = self.request;
        let configuration = setup.value_low();

        if configuration > self.properties.total_configurations
            || setup.value_high() != 0
            || setup.index != 0
        {
            return Err(RequestError::Unsupported);
        }

        self.session.select_configuration(configuration);
        self.class
            .on_set_configuration(&self.session, &mut self.transport);

        Ok(())
    }

    fn standard_set_device_feature(&mut self) -> Result<(), RequestError> {
        let setup = self.request;

        if setup.value != feature::DEVICE_REMOTE_WAKEUP || setup.index != 0 {
            return Err(RequestError::Unsupported);
        }

        self.session.feature |= current_feature::REMOTE_WAKEUP;
        self.class.on_set_device_feature(&self.session);

        Ok(())
    }

    fn standard_clear_device_feature(&mut self) -> Result<(), RequestError> {
        let setup = self.request;

        if setup.value != feature::DEVICE_REMOTE_WAKEUP
            || setup.index != 0
            || !self.session.remote_wakeup_enabled()
        {
            return Err(RequestError::Unsupported);
        }

        self.session.feature &= !current_feature::REMOTE_WAKEUP;

        Ok(())
    }

    fn standard_set_interface(&mut self) -> Result<(), RequestError> {
        let setup = self.request;
        let interface = setup.index_low();
        let alternate = setup.value_low();

        if !self.session.is_configured() {
            return Err(RequestError::Unsupported);
        }

        self.class.interface_setting(interface, alternate)?;

        if setup.index_high() != 0 || setup.value_high() != 0 {
            return Err(RequestError::Unsupported);
        }

        self.class
            .on_set_interface(&self.session, interface, alternate);
        self.session.interface = interface;
        self.session.alternate_setting = alternate;

        Ok(())
    }

    fn standard_clear_endpoint_feature(&mut self) -> Result<(), RequestError> {
        let setup = self.request;

        if setup.value != feature::ENDPOINT_STALL || setup.index_high() != 0 {
            return Err(RequestError::Unsupported);
        }

        let index_low = setup.index_low();
        let endpoint = endpoint_number(index_low);

        if endpoint >= self.properties.total_endpoints
            || !self.endpoint_status(index_low).is_enabled()
            || !self.session.is_configured()
        {
            return Err(RequestError::Unsupported);
        }

        if is_in_endpoint(index_low) {
            if self.transport.is_tx_stalled(endpoint) {
                self.transport.clear_tx_toggle(endpoint);
                self.transport.set_tx_status(endpoint, EndpointStatus::Valid);
            }
        } else if self.transport.is_rx_stalled(endpoint) {
            if endpoint == ENDPOINT0 {
                self.transport
                    .set_rx_count(endpoint, self.properties.max_packet_size);
            } else {
                self.transport.clear_rx_toggle(endpoint);
            }
            self.transport.set_rx_status(endpoint, EndpointStatus::Valid);
        }

        debug!("cleared halt on endpoint {:#04x}", index_low);
        self.class.on_clear_feature(&self.session);

        Ok(())
    }

    fn standard_set_endpoint_feature(&mut self) -> Result<(), RequestError> {
        let setup = self.request;
        let index_low = setup.index_low();
        let endpoint = endpoint_number(index_low);

        if endpoint >= self.properties.total_endpoints
            || setup.value != feature::ENDPOINT_STALL
            || setup.index_high() != 0
            || !self.endpoint_status(index_low).is_enabled()
            || !self.session.is_configured()
        {
            return Err(RequestError::Unsupported);
        }

        if is_in_endpoint(index_low) {
            self.transport.set_tx_status(endpoint, EndpointStatus::Stall);
        } else {
            self.transport.set_rx_status(endpoint, EndpointStatus::Stall);
        }

        debug!("halted endpoint {:#04x}", index_low);
        self.class.on_set_endpoint_feature(&self.session);

        Ok(())
    }

    /// Resolve a standard request with a data stage to the stream that
    /// serves it.
    ///
    /// `None` means the request is not a valid standard request (or the
    /// descriptor does not exist) and the class gets to handle it.
    pub(super) fn standard_data_request(&mut self) -> Option<Box<dyn InStream>> {
        let setup = self.request;

        match setup.request {
            request::GET_DESCRIPTOR if setup.is_standard_for(Recipient::Device) => {
                self.standard_get_descriptor()
            }
            request::GET_STATUS => self.standard_get_status(),
            request::GET_CONFIGURATION if setup.is_standard_for(Recipient::Device) => {
                self.class.on_get_configuration(&self.session);
                Some(BytesStream::from_vec(vec![self.session.configuration()]).boxed())
            }
            request::GET_INTERFACE => self.standard_get_interface(),
            _ => None,
        }
    }

    fn standard_get_descriptor(&self) -> Option<Box<dyn InStream>> {
        let setup = self.request;

        match setup.value_high() {
            descriptor_type::DEVICE => self.class.device_descriptor(),
            descriptor_type::CONFIGURATION => self.class.configuration_descriptor(setup.value_low()),
            descriptor_type::STRING => self.class.string_descriptor(setup.value_low(), setup.index),
            descriptor_type::DEVICE_BOS => self.class.bos_descriptor(),
            _ => None,
        }
    }

    fn standard_get_status(&mut self) -> Option<Box<dyn InStream>> {
        let setup = self.request;

        if setup.value != 0 || setup.length != 2 || setup.index_high() != 0 {
            return None;
        }

        let index_low = setup.index_low();
        let first = match setup.recipient() {
            Recipient::Device if setup.is_standard_for(Recipient::Device) => {
                if setup.index != 0 {
                    return None;
                }

                let mut first = 0;
                if self.session.self_powered() {
                    first |= status::SELF_POWERED_OR_HALT;
                }
                if self.session.remote_wakeup_enabled() {
                    first |= status::REMOTE_WAKEUP;
                }
                self.class.on_get_status(&self.session);
                first
            }
            Recipient::Interface if setup.is_standard_for(Recipient::Interface) => {
                if self.class.interface_setting(index_low, 0).is_err()
                    || !self.session.is_configured()
                {
                    return None;
                }
                0
            }
            Recipient::Endpoint if setup.is_standard_for(Recipient::Endpoint) => {
                let endpoint = index_low & endpoint_index::NUMBER_MASK;
                let endpoint_status = self.endpoint_status(index_low);

                if endpoint >= self.properties.total_endpoints
                    || index_low & endpoint_index::RESERVED_MASK != 0
                    || !endpoint_status.is_enabled()
                {
                    return None;
                }

                self.class.on_get_status(&self.session);
                if endpoint_status == EndpointStatus::Stall {
                    status::SELF_POWERED_OR_HALT
                } else {
                    0
                }
            }
            _ => return None,
        };

        Some(BytesStream::from_vec(vec![first, 0]).boxed())
    }

    fn standard_get_interface(&mut self) -> Option<Box<dyn InStream>> {
        let setup = self.request;

        if !setup.is_standard_for(Recipient::Interface)
            || !self.session.is_configured()
            || setup.value != 0
            || setup.index_high() != 0
            || setup.length != 1
            || self.class.interface_setting(setup.index_low(), 0).is_err()
        {
            return None;
        }

        self.class.on_get_interface(&self.session);
        Some(BytesStream::from_vec(vec![self.session.alternate_setting()]).boxed())
    }
}
