//! Downstream side of a USB storage isolation link.
//!
//! Storage commands arrive as packets over a trusted link, are checked against
//! the one attached and untrusted mass storage unit, and are executed through
//! a USB host backend. See [`downstream`] for the command translator itself.

pub mod config;
pub mod downstream;
pub mod error;
pub mod host;
pub mod link;
pub mod protocol;
pub mod scsi;
pub mod session;
pub mod usb;
