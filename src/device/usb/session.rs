//! # Device Session State
//!
//! The state a USB device keeps between control transfers: the selected
//! configuration, interface and alternate setting, the device feature bits
//! and the visible device state from chapter 9.4 of the USB 2.0
//! specification.

use tracing::debug;

use super::constants::current_feature;

/// The visible device states (USB 2.0, Section 9.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// Connected to the bus, but not powered yet.
    #[default]
    Attached,
    /// Powered, waiting for the first bus reset.
    Powered,
    /// Reset, answering at address 0.
    Default,
    /// An address was assigned.
    Addressed,
    /// A non-zero configuration was selected.
    Configured,
    /// The bus was idle for 3ms.
    Suspended,
}

/// The per-connection state of a device.
///
/// Only the standard request handlers and bus events change it. Class
/// hooks get a shared reference to read it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSession {
    pub(super) configuration: u8,
    pub(super) interface: u8,
    pub(super) alternate_setting: u8,
    pub(super) feature: u8,
    pub(super) address: u8,
    pub(super) state: DeviceState,
    /// The state to return to when the bus resumes.
    pub(super) resume_state: Option<DeviceState>,
}

impl DeviceSession {
    /// The selected configuration, 0 if unconfigured.
    #[must_use]
    pub const fn configuration(&self) -> u8 {
        self.configuration
    }

    /// The interface of the last successful SET_INTERFACE.
    #[must_use]
    pub const fn interface(&self) -> u8 {
        self.interface
    }

    /// The alternate setting of the last successful SET_INTERFACE.
    #[must_use]
    pub const fn alternate_setting(&self) -> u8 {
        self.alternate_setting
    }

    /// The device feature byte, laid out like `bmAttributes`.
    #[must_use]
    pub const fn feature(&self) -> u8 {
        self.feature
    }

    /// The address committed after the last SET_ADDRESS.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    /// The current device state.
    #[must_use]
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Returns true if a non-zero configuration is selected.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.configuration != 0
    }

    /// Returns true if the host enabled remote wakeup.
    #[must_use]
    pub const fn remote_wakeup_enabled(&self) -> bool {
        self.feature & current_feature::REMOTE_WAKEUP != 0
    }

    /// Returns true if the device reports itself as self-powered.
    #[must_use]
    pub const fn self_powered(&self) -> bool {
        self.feature & current_feature::SELF_POWERED != 0
    }

    pub(super) fn set_state(&mut self, state: DeviceState) {
        if self.state != state {
            debug!("device state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Forget everything the host negotiated.
    ///
    /// `attributes` is the `bmAttributes` byte of the configuration
    /// descriptor. Only its self-powered bit survives; remote wakeup has to
    /// be enabled by the host again.
    pub(super) fn reset(&mut self, attributes: u8) {
        self.configuration = 0;
        self.interface = 0;
        self.alternate_setting = 0;
        self.feature = attributes & current_feature::SELF_POWERED;
        self.address = 0;
        self.resume_state = None;
        self.set_state(DeviceState::Default);
    }

    pub(super) fn select_configuration(&mut self, configuration: u8) {
        self.configuration = configuration;

        if configuration != 0 {
            self.set_state(DeviceState::Configured);
        } else if self.address != 0 {
            self.set_state(DeviceState::Addressed);
        } else {
            self.set_state(DeviceState::Default);
        }
    }

    pub(super) fn commit_address(&mut self, address: u8) {
        self.address = address;
        self.set_state(if address != 0 {
            DeviceState::Addressed
        } else {
            DeviceState::Default
        });
    }

    pub(super) fn suspend(&mut self) {
        if self.state != DeviceState::Suspended {
            self.resume_state = Some(self.state);
            self.set_state(DeviceState::Suspended);
        }
    }

    pub(super) fn wake_up(&mut self) {
        if let Some(state) = self.resume_state.take() {
            self.set_state(state);
        }
    }
}
