//! # Acknowledged Frame Exchange
//!
//! Every frame the host sends is answered by a single ACK byte. This module
//! owns that conversation for one lease:
//!
//! 1. honour the settle window left by the previous motion command
//! 2. discard whatever is already waiting on the input side
//! 3. write the frame
//! 4. wait for the reply; on silence or a stray byte, back off and resend
//!
//! The ACK carries no frame identity, so a frame that was resent after a
//! timeout may still have an ACK in flight once it succeeds. Those late ACKs
//! are drained before the next frame goes out; an ACK later than
//! [`LATE_ACK_FACTOR`] timeouts after its write is considered lost.
//!
//! A failed write is a link fault and is never retried. In dry-run mode
//! there is no connection at all and every exchange succeeds immediately.

use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, RetryPolicy, Timing};
use crate::device::DeviceConnection;
use crate::error::JobError;
use crate::protocol::commands::{ControlCommand, ACK, VERSION_LEN};
use crate::protocol::frame::{self, Interleaved, StatusScanner};
use crate::transport::{AckRead, Transport};

/// Firmware string reported when the version bytes never arrive.
pub(crate) const UNKNOWN_FIRMWARE: &str = "unknown";

/// Firmware string reported by dry-run links.
pub(crate) const DRY_RUN_FIRMWARE: &str = "dry-run";

/// How many timeouts after its write an ACK may still turn up.
pub(crate) const LATE_ACK_FACTOR: u32 = 2;

enum Reply<T> {
    Done(T),
    Unexpected(u8),
    Timeout,
}

/// ACKs a resent frame may still be owed, and until when to expect them.
struct Owed {
    acks: usize,
    until: Instant,
}

pub(crate) struct Link<'a> {
    conn: Option<&'a mut DeviceConnection>,
    timing: Timing,
    retry: RetryPolicy,
    settle: Duration,
    owed: Option<Owed>,
}

impl<'a> Link<'a> {
    pub fn hardware(conn: &'a mut DeviceConnection, config: &Config) -> Self {
        Self {
            conn: Some(conn),
            timing: config.timing,
            retry: config.retry,
            settle: config.spec.settle,
            owed: None,
        }
    }

    pub fn dry_run(config: &Config) -> Self {
        Self {
            conn: None,
            timing: config.timing,
            retry: config.retry,
            settle: config.spec.settle,
            owed: None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.conn.is_none()
    }

    pub fn connection(&mut self) -> Option<&mut DeviceConnection> {
        self.conn.as_deref_mut()
    }

    /// Block until the post-motion settle window has passed.
    pub fn wait_settle(&self) {
        let Some(last) = self.conn.as_ref().and_then(|c| c.last_motion()) else {
            return;
        };
        let remaining = self.settle.saturating_sub(last.elapsed());
        if !remaining.is_zero() {
            log::trace!("Settling {:?}", remaining);
            thread::sleep(remaining);
        }
    }

    /// Discard stale input on the wire.
    pub fn clear_input(&mut self) -> Result<(), JobError> {
        if let Some(conn) = self.conn.as_deref_mut() {
            conn.transport().clear_input()?;
        }
        Ok(())
    }

    /// Send a control command and wait for its ACK.
    pub fn command(&mut self, command: ControlCommand) -> Result<(), JobError> {
        let bytes = command.encode()?;
        let what = command.describe();
        let timeout = self.timing.ack_timeout;
        self.exchange(&what, &bytes, command.is_motion(), timeout, |t, timeout| {
            Ok(match t.read_ack(timeout)? {
                AckRead::Ack => Reply::Done(()),
                AckRead::Unexpected(b) => Reply::Unexpected(b),
                AckRead::Timeout => Reply::Timeout,
            })
        })
        .map(|_| ())
    }

    /// Send a control command while the device is burning. Status frames
    /// that arrive ahead of the ACK are skipped rather than taken as stray
    /// replies.
    pub fn command_while_burning(&mut self, command: ControlCommand) -> Result<(), JobError> {
        let bytes = command.encode()?;
        let what = command.describe();
        let timeout = self.timing.ack_timeout;
        self.exchange(&what, &bytes, command.is_motion(), timeout, |t, timeout| {
            let deadline = Instant::now() + timeout;
            let mut scanner = StatusScanner::new();
            let mut byte = [0u8; 1];
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || t.read(&mut byte, remaining)? == 0 {
                    return Ok(Reply::Timeout);
                }
                match scanner.absorb(byte[0]) {
                    Interleaved::Partial => {}
                    Interleaved::Status(pct) => {
                        log::trace!(target: "wainlux::wire", "<- status {}% (skipped)", pct);
                    }
                    Interleaved::Other(ACK) => return Ok(Reply::Done(())),
                    Interleaved::Other(b) => return Ok(Reply::Unexpected(b)),
                }
            }
        })
        .map(|_| ())
    }

    /// Identify handshake. Returns the firmware version string.
    pub fn query_status(&mut self) -> Result<String, JobError> {
        if self.is_dry_run() {
            return Ok(DRY_RUN_FIRMWARE.to_string());
        }
        let command = ControlCommand::Status;
        let bytes = command.encode()?;
        let timeout = self.timing.connect_timeout;
        let firmware = self.exchange("status", &bytes, false, timeout, |t, timeout| {
            match t.read_ack(timeout)? {
                AckRead::Ack => {}
                AckRead::Unexpected(b) => return Ok(Reply::Unexpected(b)),
                AckRead::Timeout => return Ok(Reply::Timeout),
            }
            let mut version = [0u8; VERSION_LEN];
            let n = t.read_exact_within(&mut version, timeout)?;
            let firmware = frame::decode_version(&version[..n]).unwrap_or_else(|e| {
                log::warn!("Status acknowledged without version: {}", e);
                UNKNOWN_FIRMWARE.to_string()
            });
            Ok(Reply::Done(firmware))
        })?;
        Ok(firmware.unwrap_or_else(|| DRY_RUN_FIRMWARE.to_string()))
    }

    /// Send one raster line and wait for its ACK.
    pub fn line(&mut self, depth: u8, power: u16, index: u16, bits: &[u8]) -> Result<(), JobError> {
        let bytes = frame::encode_line(depth, power, index, bits)?;
        let what = format!("line {}", index);
        let timeout = self.timing.ack_timeout;
        self.exchange(&what, &bytes, false, timeout, |t, timeout| {
            Ok(match t.read_ack(timeout)? {
                AckRead::Ack => Reply::Done(()),
                AckRead::Unexpected(b) => Reply::Unexpected(b),
                AckRead::Timeout => Reply::Timeout,
            })
        })
        .map(|_| ())
    }

    /// Wait up to `timeout` for the next burn status frame. Stray bytes are
    /// skipped. Dry-run links report the burn as finished.
    pub fn next_burn_status(
        &mut self,
        scanner: &mut StatusScanner,
        timeout: Duration,
    ) -> Result<Option<u8>, JobError> {
        let Some(conn) = self.conn.as_deref_mut() else {
            return Ok(Some(100));
        };
        let deadline = Instant::now() + timeout;
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if conn.transport().read(&mut byte, remaining)? == 0 {
                return Ok(None);
            }
            if let Some(pct) = scanner.push(byte[0]) {
                return Ok(Some(pct));
            }
        }
    }

    /// Write `bytes` and wait for a reply, retrying per the policy. Returns
    /// `None` on dry-run links.
    fn exchange<T, F>(
        &mut self,
        what: &str,
        bytes: &[u8],
        motion: bool,
        timeout: Duration,
        mut await_reply: F,
    ) -> Result<Option<T>, JobError>
    where
        F: FnMut(&mut dyn Transport, Duration) -> Result<Reply<T>, JobError>,
    {
        if self.is_dry_run() {
            log::trace!("dry-run: {}", what);
            return Ok(None);
        }

        self.drain_owed()?;

        let attempts = self.retry.max_attempts.max(1);
        let mut last_stray = None;
        let mut unanswered = 0;
        for attempt in 1..=attempts {
            self.wait_settle();
            let Some(conn) = self.conn.as_deref_mut() else {
                return Ok(None);
            };

            conn.transport().clear_input()?;
            log::trace!(target: "wainlux::wire", "-> {} ({} bytes)", what, bytes.len());
            conn.transport().write(bytes)?;
            let written = Instant::now();
            if motion {
                conn.note_motion(written);
            }

            match await_reply(conn.transport(), timeout)? {
                Reply::Done(value) => {
                    // The ACK taken may belong to an earlier attempt; the
                    // later writes can still be answered.
                    if unanswered > 0 {
                        self.owed = Some(Owed {
                            acks: unanswered,
                            until: written + timeout * LATE_ACK_FACTOR,
                        });
                    }
                    return Ok(Some(value));
                }
                Reply::Unexpected(byte) => {
                    log::warn!(
                        "{}: unexpected reply {:#04x} (attempt {}/{})",
                        what,
                        byte,
                        attempt,
                        attempts
                    );
                    last_stray = Some(byte);
                }
                Reply::Timeout => {
                    log::warn!("{}: no ACK (attempt {}/{})", what, attempt, attempts);
                    last_stray = None;
                    unanswered += 1;
                }
            }

            if attempt < attempts {
                thread::sleep(self.retry.backoff(attempt));
            }
        }

        Err(match last_stray {
            Some(byte) => JobError::Protocol(format!(
                "{} answered with {:#04x} instead of ACK",
                what, byte
            )),
            None => JobError::AckTimeout {
                what: what.to_string(),
                attempts,
            },
        })
    }

    /// Swallow late ACKs still owed to the previous frame.
    fn drain_owed(&mut self) -> Result<(), JobError> {
        let Some(mut owed) = self.owed.take() else {
            return Ok(());
        };
        let Some(conn) = self.conn.as_deref_mut() else {
            return Ok(());
        };
        let mut byte = [0u8; 1];
        while owed.acks > 0 {
            let remaining = owed.until.saturating_duration_since(Instant::now());
            if remaining.is_zero() || conn.transport().read(&mut byte, remaining)? == 0 {
                break;
            }
            log::debug!(target: "wainlux::wire", "<- late reply {:#04x} discarded", byte[0]);
            if byte[0] == ACK {
                owed.acks -= 1;
            }
        }
        Ok(())
    }
}
