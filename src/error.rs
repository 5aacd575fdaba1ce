//! # Error Types
//!
//! This module defines error types used throughout the wainlux library.
//!
//! Each concern gets its own enum so callers can match on what actually
//! went wrong:
//!
//! | Type | Raised by | Fatal to a job? |
//! |------|-----------|-----------------|
//! | [`TransportError`] | serial / mock channel | yes |
//! | [`CodecError`] | frame encode/decode | yes (malformed output) |
//! | [`BoundsError`] | image pipeline | yes |
//! | [`JobError`] | job controller | terminal outcome |
//! | [`RenderError`] | calibration patterns, QR cards | n/a |
//! | [`WainluxError`] | CLI entry points | n/a |

use thiserror::Error;

/// Failures of the byte channel to the device.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The port could not be opened or configured
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// A frame could not be written in full before the write timeout
    #[error("Write failed: {0}")]
    Write(String),

    /// The read side failed (not a timeout)
    #[error("Read failed: {0}")]
    Read(String),

    /// An operation was attempted on a transport that is not open
    #[error("Transport is not open")]
    Closed,

    /// The device went away while the port was open
    #[error("Device disconnected")]
    Disconnected,

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame encoding/decoding errors. The codec owns no I/O, so these are
/// always about the shape of the bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Payload length field says {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Header checksum mismatch: expected {expected:#04x}, got {got:#04x}")]
    Checksum { expected: u8, got: u8 },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// Image pipeline errors. Oversized images are never an error; they are
/// scaled down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoundsError {
    #[error("Image has zero area ({width}x{height})")]
    ZeroArea { width: u32, height: u32 },

    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Invalid canvas {width}x{height}")]
    InvalidCanvas { width: u32, height: u32 },
}

/// Terminal failures of a burn job or a device control operation.
#[derive(Debug, Error)]
pub enum JobError {
    /// Port open/write failure or I/O fault
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The device answered with something other than an ACK
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Retries exhausted waiting for an acknowledgement
    #[error("No acknowledgement for {what} after {attempts} attempts")]
    AckTimeout { what: String, attempts: u32 },

    #[error("Image error: {0}")]
    Bounds(#[from] BoundsError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Another job or control operation holds the device
    #[error("Device busy: another operation holds the connection")]
    Busy,

    #[error("Job cancelled")]
    Cancelled,

    #[error("Device disconnected mid-job")]
    Disconnected,

    /// The device stopped reporting before the burn got far enough
    #[error("Burn incomplete (last reported {last_percent}%)")]
    BurnIncomplete { last_percent: u8 },

    #[error("Device not connected")]
    NotConnected,

    /// A control request outside the work area
    #[error("Position {x}x{y} is outside the work area")]
    OutOfBounds { x: u32, y: u32 },

    /// The job thread died without producing an outcome
    #[error("Job aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Stable, machine-readable error kind carried in terminal progress events.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Transport(_) => "transport",
            JobError::Protocol(_) => "protocol",
            JobError::AckTimeout { .. } => "ack_timeout",
            JobError::Bounds(_) => "bounds",
            JobError::Codec(_) => "codec",
            JobError::Busy => "busy",
            JobError::Cancelled => "cancelled",
            JobError::Disconnected => "disconnected",
            JobError::BurnIncomplete { .. } => "burn_incomplete",
            JobError::NotConnected => "not_connected",
            JobError::OutOfBounds { .. } => "out_of_bounds",
            JobError::Aborted(_) => "aborted",
        }
    }

    /// True when the physical link can no longer be trusted.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, JobError::Transport(_) | JobError::Disconnected)
    }
}

impl From<TransportError> for JobError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => JobError::Disconnected,
            other => JobError::Transport(other),
        }
    }
}

/// Errors from the calibration pattern and QR card generators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Unknown pattern '{0}'")]
    UnknownPattern(String),

    #[error("SSID cannot be empty")]
    EmptySsid,

    #[error("QR generation failed: {0}")]
    Qr(String),

    #[error("QR code does not fit in {available}px")]
    QrTooLarge { available: u32 },
}

/// Main error type for wainlux entry points
#[derive(Debug, Error)]
pub enum WainluxError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Job(#[from] JobError),

    #[error("Image error: {0}")]
    Bounds(#[from] BoundsError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Image encoding error (PNG previews)
    #[error("Image error: {0}")]
    Image(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
