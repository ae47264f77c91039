//! Protocol module - HID bootloader command definitions and report framing.

pub mod constants;
pub mod frame;

pub use constants::*;
pub use frame::{Command, Frame};
