//! # Device Emulation Code
//!
//! This module contains the USB device stack. It never touches hardware
//! directly; all endpoint access goes through [`transport`].

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod transport;
pub mod usb;
