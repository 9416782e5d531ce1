//! Vehicle module - Firmware side of a RailFi locomotive
//!
//! This module provides:
//! - Actuator and radio interfaces, with simulated and Linux implementations
//! - The command responder serving a station session
//! - The pairing state machine that finds a station

mod actuators;
mod pairing;
mod responder;
mod simulated;

#[cfg(target_os = "linux")]
mod linux;

pub use actuators::*;
pub use pairing::*;
pub use responder::*;
pub use simulated::*;

#[cfg(target_os = "linux")]
pub use linux::{GpioLights, NmClient, NmHotspot, PwmMotor};

/// Whether real hardware backends exist on this platform
pub fn hardware_supported() -> bool {
    cfg!(target_os = "linux")
}
