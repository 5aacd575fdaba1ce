//! # K6 Command Set
//!
//! This module names every opcode the K6 firmware understands and builds the
//! control frames the job controller sends.
//!
//! ## Opcodes
//!
//! Values come from captured USB traffic of the vendor application:
//!
//! | Opcode | Name | Payload | Motion |
//! |--------|------|---------|--------|
//! | `0xFF` | Status / identify | none | no |
//! | `0x0A` | Connect | none | no |
//! | `0x06` | Crosshair on | none | no |
//! | `0x07` | Crosshair off | none | no |
//! | `0x16` | Stop | none | no |
//! | `0x17` | Home | none | **yes** |
//! | `0x20` | Bounds (preview rectangle / jog) | w, h, cx, cy | **yes** |
//! | `0x21` | Framing (leave preview) | none | no |
//! | `0x22` | Raster line | packed row | no |
//! | `0x23` | Job header | w, h, cx, cy, total | no |
//! | `0x24` | Start burn | none | no |
//!
//! ## Replies
//!
//! The device answers every accepted frame with a single [`ACK`] byte. The
//! status query is followed by three version bytes; a running burn streams
//! `FF FF 00 <percent>` status frames.

use std::fmt;

use crate::error::CodecError;
use crate::protocol::frame;

/// Acknowledgement byte
pub const ACK: u8 = 0x09;

/// Prefix of a burn progress status frame (`FF FF 00 <pct>`)
pub const STATUS_PREFIX: [u8; 3] = [0xFF, 0xFF, 0x00];

/// Length of a burn progress status frame
pub const STATUS_FRAME_LEN: usize = 4;

/// Bytes following the ACK of a status query
pub const VERSION_LEN: usize = 3;

/// Protocol opcode (first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Status = 0xFF,
    Connect = 0x0A,
    CrosshairOn = 0x06,
    CrosshairOff = 0x07,
    Stop = 0x16,
    Home = 0x17,
    Bounds = 0x20,
    Framing = 0x21,
    Line = 0x22,
    JobHeader = 0x23,
    StartBurn = 0x24,
}

impl Opcode {
    pub const ALL: [Opcode; 11] = [
        Opcode::Status,
        Opcode::Connect,
        Opcode::CrosshairOn,
        Opcode::CrosshairOff,
        Opcode::Stop,
        Opcode::Home,
        Opcode::Bounds,
        Opcode::Framing,
        Opcode::Line,
        Opcode::JobHeader,
        Opcode::StartBurn,
    ];

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name, as shown in command plans and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Status => "STATUS",
            Opcode::Connect => "CONNECT",
            Opcode::CrosshairOn => "CROSSHAIR_ON",
            Opcode::CrosshairOff => "CROSSHAIR_OFF",
            Opcode::Stop => "STOP",
            Opcode::Home => "HOME",
            Opcode::Bounds => "BOUNDS",
            Opcode::Framing => "FRAMING",
            Opcode::Line => "LINE",
            Opcode::JobHeader => "JOB_HEADER",
            Opcode::StartBurn => "START_BURN",
        }
    }

    /// Commands that physically move the head. The next frame may only be
    /// issued after the device settle delay.
    pub const fn is_motion(self) -> bool {
        matches!(self, Opcode::Home | Opcode::Bounds)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.as_u8() == value)
            .ok_or(CodecError::UnknownOpcode(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

/// A control command, i.e. anything that is not a raster line.
///
/// ## Example
///
/// ```
/// use wainlux::protocol::commands::{ControlCommand, Opcode};
///
/// let frame = ControlCommand::Home.encode().unwrap();
/// assert_eq!(frame[0], Opcode::Home as u8);
/// assert_eq!(frame.len(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Identify handshake; answered with ACK + version bytes
    Status,
    Connect,
    Home,
    Stop,
    /// Leave preview mode ahead of a burn
    Framing,
    /// Trace a preview rectangle centred on (cx, cy)
    Bounds {
        width: u16,
        height: u16,
        center_x: u16,
        center_y: u16,
    },
    /// Move the head to (x, y): a 1×1 bounds rectangle
    Jog { x: u16, y: u16 },
    /// Announce raster geometry before the line frames
    JobHeader {
        width: u16,
        height: u16,
        center_x: u16,
        center_y: u16,
        total_bytes: u32,
    },
    StartBurn,
    Crosshair(bool),
}

impl ControlCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            ControlCommand::Status => Opcode::Status,
            ControlCommand::Connect => Opcode::Connect,
            ControlCommand::Home => Opcode::Home,
            ControlCommand::Stop => Opcode::Stop,
            ControlCommand::Framing => Opcode::Framing,
            ControlCommand::Bounds { .. } | ControlCommand::Jog { .. } => Opcode::Bounds,
            ControlCommand::JobHeader { .. } => Opcode::JobHeader,
            ControlCommand::StartBurn => Opcode::StartBurn,
            ControlCommand::Crosshair(true) => Opcode::CrosshairOn,
            ControlCommand::Crosshair(false) => Opcode::CrosshairOff,
        }
    }

    /// Parameter payload, big-endian.
    pub fn params(&self) -> Vec<u8> {
        match *self {
            ControlCommand::Bounds {
                width,
                height,
                center_x,
                center_y,
            } => be_words(&[width, height, center_x, center_y]),
            ControlCommand::Jog { x, y } => be_words(&[1, 1, x, y]),
            ControlCommand::JobHeader {
                width,
                height,
                center_x,
                center_y,
                total_bytes,
            } => {
                let mut params = be_words(&[width, height, center_x, center_y]);
                params.extend_from_slice(&total_bytes.to_be_bytes());
                params
            }
            _ => Vec::new(),
        }
    }

    /// Encode into a complete wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        frame::encode_control(self.opcode(), &self.params())
    }

    #[inline]
    pub fn is_motion(&self) -> bool {
        self.opcode().is_motion()
    }

    /// True when the device follows the ACK with version bytes.
    #[inline]
    pub fn expects_version(&self) -> bool {
        matches!(self, ControlCommand::Status)
    }

    /// Short human-readable description for logs and plans.
    pub fn describe(&self) -> String {
        match *self {
            ControlCommand::Status => "Query status / firmware version".to_string(),
            ControlCommand::Connect => "Connect".to_string(),
            ControlCommand::Home => "Home the head".to_string(),
            ControlCommand::Stop => "Stop".to_string(),
            ControlCommand::Framing => "Leave preview mode".to_string(),
            ControlCommand::Bounds {
                width,
                height,
                center_x,
                center_y,
            } => format!("Preview {width}x{height} at ({center_x}, {center_y})"),
            ControlCommand::Jog { x, y } => format!("Move to ({x}, {y})"),
            ControlCommand::JobHeader {
                width,
                height,
                total_bytes,
                ..
            } => format!("Job header {width}x{height}, {total_bytes} bytes"),
            ControlCommand::StartBurn => "Start burn".to_string(),
            ControlCommand::Crosshair(on) => {
                format!("Crosshair {}", if on { "on" } else { "off" })
            }
        }
    }
}

fn be_words(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

// ============================================================================
// TESTS
// ============================================================================
