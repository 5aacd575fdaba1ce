//! # Device Module
//!
//! This module describes the engraver hardware and arbitrates access to it.
//!
//! ## Modules
//!
//! - [`spec`]: Engraver hardware specifications
//! - [`connection`]: The exclusive device handle and its status snapshot

pub mod connection;
pub mod spec;

pub use connection::{
    ConnectionState, Device, DeviceConnection, DeviceLease, OperationMode, StatusSnapshot,
};
pub use spec::DeviceSpec;
