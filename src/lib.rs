//! # hk32-usbd
//!
//! A USB full-speed device control-transfer engine for endpoint hardware in
//! the style of the HK32L0xx/STM32 USB FS peripheral, with an in-memory
//! transport and a simulated host to drive it.

pub mod device;
