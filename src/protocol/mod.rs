//! # K6 Wire Protocol
//!
//! Pure byte-level encoding for the Wainlux K6 serial protocol. Nothing in
//! this module performs I/O.
//!
//! ## Module Structure
//!
//! - [`commands`]: opcode table and control command builders
//! - [`frame`]: the 9-byte header codec, ACK and status frame recognition
//! - [`plan`]: a frame-by-frame listing of a burn, for previews
//!
//! ## Usage Example
//!
//! ```
//! use wainlux::protocol::{commands::ControlCommand, frame};
//!
//! // Home the head
//! let home = ControlCommand::Home.encode().unwrap();
//! assert_eq!(home.len(), frame::HEADER_LEN);
//!
//! // One raster line: 16 pixels, the first 8 fire
//! let line = frame::encode_line(100, 1000, 0, &[0xFF, 0x00]).unwrap();
//! let (header, payload) = frame::decode_frame(&line).unwrap();
//! assert_eq!(header.depth, 100);
//! assert_eq!(payload, &[0xFF, 0x00]);
//! ```
//!
//! ## Protocol Reference
//!
//! There is no published specification. Opcodes, the header layout and the
//! timing rules were recovered from USB captures of the vendor software.

pub mod commands;
pub mod frame;
pub mod plan;
