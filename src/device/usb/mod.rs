//! # USB Device Stack
//!
//! The control-transfer engine of a USB full-speed device and everything it
//! needs around it:
//!
//! - [`setup`] decodes SETUP packets.
//! - [`device`] holds [`UsbDevice`], the per-device
//!   context, and [`control`] the endpoint 0 state machine that runs on it.
//! - [`class`] is the interface a device class implements, [`vcp`] a
//!   virtual COM port implementing it.
//! - [`descriptors`] builds and serves descriptors.
//! - [`host`] and [`pcap`] simulate a host and capture its traffic.

pub mod class;
pub mod constants;
pub mod control;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod host;
pub mod pcap;
pub mod session;
pub mod setup;
mod standard;
pub mod stream;
pub mod vcp;

pub use class::{DataSetup, DeviceProperties, StandardHooks, UsbClass};
pub use control::{ControlState, Ep0Event, TransferOutcome};
pub use device::UsbDevice;
pub use error::{ControlError, PropertiesError, RequestError};
pub use session::{DeviceSession, DeviceState};
pub use setup::SetupRequest;
pub use stream::{BytesStream, InStream};
