//! remote-gamepad - turn an IR/RF remote into a gamepad
//!
//! This crate compiles gamepad HID report descriptors, provisions a USB
//! HID gadget through configfs and dispatches remote events either to a
//! local virtual gamepad or to the gadget endpoint.

pub mod config;
pub mod error;
pub mod hid;
pub mod otg;
pub mod utils;

pub use error::{AppError, Result};
