//! # Control Transfer Errors

use thiserror::Error;

use super::control::{ControlState, Ep0Event};
use super::setup::SetupParseError;

/// Why a request handler did not accept a request.
///
/// `Ok(..)` from a handler corresponds to SUCCESS.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// The request is invalid or not implemented. The engine stalls.
    #[error("request is not supported")]
    Unsupported,
    /// The handler needs more time to prepare data. The engine pauses until
    /// it is explicitly resumed.
    #[error("request data is not ready")]
    NotReady,
}

/// Why the engine stalled endpoint 0 or refused an operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// A handler rejected the request.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The SETUP packet could not be decoded.
    #[error(transparent)]
    MalformedSetup(#[from] SetupParseError),

    /// A token arrived in a state where it is not legal.
    #[error("{event:?} token is not legal in state {state:?}")]
    ProtocolViolation {
        /// The state the engine was in.
        state: ControlState,
        /// The token that arrived.
        event: Ep0Event,
    },

    /// [`resume_control_transfer`](super::device::UsbDevice::resume_control_transfer)
    /// was called while no transfer was paused.
    #[error("no control transfer is paused")]
    NotPaused,
}

/// Why a device cannot be created from the properties of its class.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertiesError {
    /// Full-speed endpoint 0 only supports 8, 16, 32 or 64 byte packets.
    #[error("endpoint 0 max packet size {0} is not 8, 16, 32 or 64")]
    InvalidMaxPacketSize(u16),
}
