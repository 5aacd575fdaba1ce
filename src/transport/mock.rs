//! # Simulated K6
//!
//! A [`Transport`] that behaves like the engraver at the contract level:
//!
//! - every well-formed frame is acknowledged after a small latency
//! - a status query is answered with ACK + three version bytes
//! - start-burn is followed by a stream of `FF FF 00 <pct>` status frames,
//!   which stop ends once its own ACK is out
//! - a frame written less than 100 ms after a motion command is refused
//!   (no ACK) and recorded as a settle violation
//!
//! Each call to [`Transport::write`] must carry exactly one frame, which is
//! how the job controller writes.
//!
//! ## Fault Injection
//!
//! Builders simulate the failure modes the retry logic must survive:
//! dropped acknowledgements (first K, per line, or at a seeded random rate),
//! a wrong byte in place of a line's ACK, an open failure, and a disconnect
//! after N frames.
//!
//! ## Inspection
//!
//! [`MockTransport::probe`] returns a cloneable [`MockProbe`] sharing the
//! transport's state, so a test can hand the transport to the controller
//! and still inspect every frame it received.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::DeviceSpec;
use crate::error::TransportError;
use crate::protocol::commands::{Opcode, ACK};
use crate::protocol::frame::{decode_frame, encode_status, FrameHeader};
use crate::transport::Transport;

/// Firmware version reported by default
pub const MOCK_FIRMWARE: [u8; 3] = [4, 0, 0];

/// Default burn progression reported after start-burn
pub const DEFAULT_BURN_STEPS: [u8; 5] = [0, 25, 50, 75, 100];

type WriteHook = Box<dyn FnMut(&FrameHeader) + Send>;

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    frames: Vec<Vec<u8>>,
    headers: Vec<FrameHeader>,
    malformed: usize,
    settle_violations: usize,
    dropped_acks: usize,
    last_motion: Option<Instant>,
    pending: VecDeque<(Instant, u8)>,
}

impl MockState {
    /// Queue `bytes` for delivery at `at`, keeping the queue in due order.
    fn schedule(&mut self, at: Instant, bytes: &[u8]) {
        let start = self.pending.partition_point(|(due, _)| *due <= at);
        for (offset, byte) in bytes.iter().enumerate() {
            self.pending.insert(start + offset, (at, *byte));
        }
    }
}

/// Read-only view into a [`MockTransport`]'s state.
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every frame received, raw, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    /// Decoded headers of every well-formed frame, in order.
    pub fn headers(&self) -> Vec<FrameHeader> {
        self.lock().headers.clone()
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.lock().headers.iter().map(|h| h.opcode).collect()
    }

    /// Line indices of every raster frame received (retries included).
    pub fn line_indices(&self) -> Vec<u16> {
        self.lock()
            .headers
            .iter()
            .filter(|h| h.is_line())
            .map(|h| h.line_index)
            .collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.lock()
            .headers
            .iter()
            .filter(|h| h.opcode == opcode)
            .count()
    }

    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn malformed(&self) -> usize {
        self.lock().malformed
    }

    pub fn settle_violations(&self) -> usize {
        self.lock().settle_violations
    }

    pub fn dropped_acks(&self) -> usize {
        self.lock().dropped_acks
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

/// # Mock Transport
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use wainlux::protocol::commands::ControlCommand;
/// use wainlux::transport::{AckRead, MockTransport, Transport};
///
/// let mut mock = MockTransport::new().with_dropped_acks(1);
/// let probe = mock.probe();
/// mock.open("mock").unwrap();
///
/// let frame = ControlCommand::Connect.encode().unwrap();
/// mock.write(&frame).unwrap();
/// assert_eq!(mock.read_ack(Duration::from_millis(50)).unwrap(), AckRead::Timeout);
/// mock.write(&frame).unwrap();
/// assert_eq!(mock.read_ack(Duration::from_millis(50)).unwrap(), AckRead::Ack);
/// assert_eq!(probe.dropped_acks(), 1);
/// ```
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    ack_latency: Duration,
    settle: Duration,
    firmware: [u8; 3],
    burn_steps: Vec<u8>,
    burn_step_interval: Duration,
    drop_first: usize,
    drop_lines: HashMap<u16, usize>,
    wrong_lines: HashMap<u16, (u8, usize)>,
    drop_rate: f64,
    rng: StdRng,
    fail_open: bool,
    disconnect_after: Option<usize>,
    hook: Option<WriteHook>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            ack_latency: Duration::from_millis(5),
            settle: DeviceSpec::K6.settle,
            firmware: MOCK_FIRMWARE,
            burn_steps: DEFAULT_BURN_STEPS.to_vec(),
            burn_step_interval: Duration::from_millis(5),
            drop_first: 0,
            drop_lines: HashMap::new(),
            wrong_lines: HashMap::new(),
            drop_rate: 0.0,
            rng: StdRng::seed_from_u64(0),
            fail_open: false,
            disconnect_after: None,
            hook: None,
        }
    }

    pub fn with_ack_latency(mut self, latency: Duration) -> Self {
        self.ack_latency = latency;
        self
    }

    /// Swallow the acknowledgements of the first `count` accepted frames.
    pub fn with_dropped_acks(mut self, count: usize) -> Self {
        self.drop_first = count;
        self
    }

    /// Swallow `count` acknowledgements for raster line `line`.
    pub fn with_dropped_line_acks(mut self, line: u16, count: usize) -> Self {
        self.drop_lines.insert(line, count);
        self
    }

    /// Answer raster line `line` with `byte` instead of ACK, `count` times.
    pub fn with_wrong_line_acks(mut self, line: u16, byte: u8, count: usize) -> Self {
        self.wrong_lines.insert(line, (byte, count));
        self
    }

    /// Drop each acknowledgement with probability `rate`, reproducibly.
    pub fn with_drop_rate(mut self, rate: f64, seed: u64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Make every `open` call fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail every write after `frames` frames have been accepted.
    pub fn disconnect_after(mut self, frames: usize) -> Self {
        self.disconnect_after = Some(frames);
        self
    }

    pub fn with_firmware(mut self, major: u8, minor: u8, patch: u8) -> Self {
        self.firmware = [major, minor, patch];
        self
    }

    /// Status percentages emitted after start-burn, one per interval.
    pub fn with_burn_progress(mut self, steps: &[u8], interval: Duration) -> Self {
        self.burn_steps = steps.to_vec();
        self.burn_step_interval = interval;
        self
    }

    /// Observe each decoded frame as it is written, before it is answered.
    pub fn with_write_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&FrameHeader) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn should_drop(&mut self, header: &FrameHeader) -> bool {
        if self.drop_first > 0 {
            self.drop_first -= 1;
            return true;
        }
        if header.is_line() {
            if let Some(remaining) = self.drop_lines.get_mut(&header.line_index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        self.drop_rate > 0.0 && self.rng.random_bool(self.drop_rate)
    }

    fn wrong_reply(&mut self, header: &FrameHeader) -> Option<u8> {
        if !header.is_line() {
            return None;
        }
        let (byte, remaining) = self.wrong_lines.get_mut(&header.line_index)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*byte)
    }

    /// Bytes the device sends back for an accepted frame.
    fn reply(&self, header: &FrameHeader, now: Instant) -> Vec<(Instant, Vec<u8>)> {
        let ack_at = now + self.ack_latency;
        match header.opcode {
            Opcode::Status => {
                let mut bytes = vec![ACK];
                bytes.extend_from_slice(&self.firmware);
                vec![(ack_at, bytes)]
            }
            Opcode::StartBurn => {
                let mut replies = vec![(ack_at, vec![ACK])];
                let mut at = ack_at;
                for pct in &self.burn_steps {
                    at += self.burn_step_interval;
                    replies.push((at, encode_status(*pct).to_vec()));
                }
                replies
            }
            _ => vec![(ack_at, vec![ACK])],
        }
    }
}

impl Transport for MockTransport {
    fn open(&mut self, port: &str) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::Open {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        let mut state = self.lock();
        state.open = true;
        state.pending.clear();
        log::debug!("Mock device opened as {}", port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let now = Instant::now();
        {
            let mut state = self.lock();
            if !state.open {
                return Err(TransportError::Closed);
            }
            if self
                .disconnect_after
                .is_some_and(|limit| state.frames.len() >= limit)
            {
                return Err(TransportError::Disconnected);
            }
            state.frames.push(bytes.to_vec());
        }

        let header = match decode_frame(bytes) {
            Ok((header, _)) => header,
            Err(e) => {
                log::warn!("Mock device ignored malformed frame: {}", e);
                self.lock().malformed += 1;
                return Ok(());
            }
        };

        if let Some(hook) = self.hook.as_mut() {
            hook(&header);
        }

        let settle = self.settle;
        {
            let mut state = self.lock();
            state.headers.push(header);
            let violated = state
                .last_motion
                .is_some_and(|at| now.duration_since(at) < settle);
            if header.opcode.is_motion() {
                state.last_motion = Some(now);
            }
            if violated {
                state.settle_violations += 1;
                log::warn!("Mock device refused {} inside settle window", header.opcode);
                return Ok(());
            }
        }

        if self.should_drop(&header) {
            self.lock().dropped_acks += 1;
            log::debug!(target: "wainlux::wire", "mock dropped ack for {}", header.opcode);
            return Ok(());
        }

        if let Some(byte) = self.wrong_reply(&header) {
            log::debug!(
                target: "wainlux::wire",
                "mock answers line {} with {:#04x}",
                header.line_index,
                byte
            );
            let at = now + self.ack_latency;
            self.lock().schedule(at, &[byte]);
            return Ok(());
        }

        let replies = self.reply(&header, now);
        let mut state = self.lock();
        if header.opcode == Opcode::Stop {
            let ack_at = now + self.ack_latency;
            state.pending.retain(|(due, _)| *due <= ack_at);
        }
        for (at, bytes) in replies {
            state.schedule(at, &bytes);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_due = {
                let mut state = self.lock();
                if !state.open {
                    return Err(TransportError::Closed);
                }
                let now = Instant::now();
                let mut n = 0;
                while n < buf.len() {
                    match state.pending.front() {
                        Some((at, byte)) if *at <= now => {
                            buf[n] = *byte;
                            n += 1;
                            state.pending.pop_front();
                        }
                        _ => break,
                    }
                }
                if n > 0 {
                    return Ok(n);
                }
                state.pending.front().map(|(at, _)| *at)
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            let wake = next_due.map_or(deadline, |at| at.min(deadline));
            thread::sleep(wake.saturating_duration_since(now));
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        let now = Instant::now();
        while state.pending.front().is_some_and(|(at, _)| *at <= now) {
            state.pending.pop_front();
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        state.open = false;
        state.pending.clear();
    }
}

// ============================================================================
// TESTS
// ============================================================================
