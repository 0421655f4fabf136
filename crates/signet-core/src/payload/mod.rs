//! Payload handling module.
//!
//! Provides parsing and write planning for firmware images.

pub mod firmware;

pub use firmware::{FirmwareError, FirmwareImage, FirmwareSection, FirmwareWriteCursor};
