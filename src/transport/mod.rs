//! # Engraver Transport Layer
//!
//! This module provides the byte channel between the job controller and the
//! engraver.
//!
//! ## Available Transports
//!
//! - [`serial`]: USB serial (CH340) at 115200 baud, raw TTY mode (Unix)
//! - [`mock`]: simulated K6 that acknowledges frames with realistic timing
//!
//! Both implement [`Transport`]. The job controller only ever sees
//! `Box<dyn Transport>`; it cannot tell them apart.
//!
//! ## Blocking Contract
//!
//! Every call is synchronous and bounded. `read` returns `Ok(0)` when the
//! timeout expires with nothing to deliver; it never blocks past the
//! timeout. The post-motion settle delay is *not* a transport concern.

pub mod mock;
pub mod serial;

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::TransportError;
use crate::protocol::frame::{decode_ack, AckStatus};

pub use mock::{MockProbe, MockTransport};
pub use serial::SerialTransport;

/// Outcome of waiting for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRead {
    Ack,
    /// Some other byte arrived where the ACK was expected
    Unexpected(u8),
    Timeout,
}

/// Bidirectional byte channel to the device.
pub trait Transport: Send {
    /// Open (or reopen) the channel.
    fn open(&mut self, port: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Write one complete frame.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read whatever is available, waiting at most `timeout` for the first
    /// byte. Returns the number of bytes read; 0 means the timeout expired.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    fn close(&mut self);

    /// Discard anything pending on the input side.
    fn clear_input(&mut self) -> Result<(), TransportError> {
        let mut scratch = [0u8; 64];
        while self.read(&mut scratch, Duration::ZERO)? > 0 {}
        Ok(())
    }

    /// Wait for the single-byte acknowledgement.
    fn read_ack(&mut self, timeout: Duration) -> Result<AckRead, TransportError> {
        let mut byte = [0u8; 1];
        if self.read(&mut byte, timeout)? == 0 {
            return Ok(AckRead::Timeout);
        }
        Ok(match decode_ack(&byte) {
            AckStatus::Ack => AckRead::Ack,
            AckStatus::NotAck => AckRead::Unexpected(byte[0]),
        })
    }

    /// Fill `buf` within an overall deadline. Returns how many bytes
    /// actually arrived.
    fn read_exact_within(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let n = self.read(&mut buf[filled..], remaining)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Build the transport selected by the configuration. Dry-run jobs never
/// touch it, but the controller still owns one.
pub fn for_config(config: &Config) -> Box<dyn Transport> {
    if config.mock {
        log::info!("Using simulated K6 (mock mode)");
        Box::new(MockTransport::new().with_ack_latency(config.timing.mock_ack_latency))
    } else {
        Box::new(SerialTransport::new(config.baud))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_config_selects_mock() {
        let config = Config {
            mock: true,
            ..Config::default()
        };
        let mut transport = for_config(&config);
        transport.open("mock").unwrap();
        assert!(transport.is_open());
    }

    #[test]
    fn test_for_config_serial_starts_closed() {
        let transport = for_config(&Config::default());
        assert!(!transport.is_open());
    }
}
