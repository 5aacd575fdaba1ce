//! # Frame Codec
//!
//! Pure encode/decode of K6 wire frames. No I/O, no retries, no waiting.
//!
//! ## Header Layout
//!
//! Every frame starts with a fixed 9-byte header. The field offsets live in
//! one table, [`LAYOUT`], so a correction from a new hardware capture touches
//! nothing outside this file.
//!
//! ```text
//! byte  0      opcode
//! bytes 1..3   payload length (u16, big-endian)
//! byte  3      depth (1..=255 on line frames, 0 on control frames)
//! bytes 4..6   power (u16, big-endian, nominal 1000)
//! bytes 6..8   line index (u16, big-endian)
//! byte  8      header checksum: two's complement of the sum of bytes 0..8
//! ```
//!
//! The payload follows the header. For raster lines it is one packed row
//! (MSB first, zero-padded to a byte boundary).

use crate::error::CodecError;
use crate::protocol::commands::{Opcode, ACK, STATUS_FRAME_LEN, STATUS_PREFIX, VERSION_LEN};

/// Fixed header size
pub const HEADER_LEN: usize = 9;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Byte offsets of the header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub opcode: usize,
    pub length: usize,
    pub depth: usize,
    pub power: usize,
    pub line: usize,
    pub checksum: usize,
}

/// Header layout validated against captured traffic.
pub const LAYOUT: HeaderLayout = HeaderLayout {
    opcode: 0,
    length: 1,
    depth: 3,
    power: 4,
    line: 6,
    checksum: 8,
};

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub payload_len: u16,
    pub depth: u8,
    pub power: u16,
    pub line_index: u16,
}

impl FrameHeader {
    /// Header of a control frame: burn fields zeroed.
    pub fn control(opcode: Opcode, payload_len: u16) -> Self {
        Self {
            opcode,
            payload_len,
            depth: 0,
            power: 0,
            line_index: 0,
        }
    }

    #[inline]
    pub fn is_line(&self) -> bool {
        self.opcode == Opcode::Line
    }

    /// Serialize, computing the checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[LAYOUT.opcode] = self.opcode.as_u8();
        put_u16(&mut out, LAYOUT.length, self.payload_len);
        out[LAYOUT.depth] = self.depth;
        put_u16(&mut out, LAYOUT.power, self.power);
        put_u16(&mut out, LAYOUT.line, self.line_index);
        out[LAYOUT.checksum] = checksum(&out[..LAYOUT.checksum]);
        out
    }
}

#[inline]
fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// 8-bit two's complement checksum: the bytes plus the checksum sum to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

fn payload_len(payload: &[u8]) -> Result<u16, CodecError> {
    u16::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge(payload.len()))
}

fn assemble(header: FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// # Encode Control Frame
///
/// Control frames carry depth, power and line index as zero; any parameters
/// ride in the payload.
pub fn encode_control(opcode: Opcode, params: &[u8]) -> Result<Vec<u8>, CodecError> {
    let header = FrameHeader::control(opcode, payload_len(params)?);
    Ok(assemble(header, params))
}

/// # Encode Raster Line Frame
///
/// ## Parameters
///
/// - `depth`: burn depth for the whole job (1-255)
/// - `power`: laser power (nominal 1000)
/// - `line_index`: row number, increasing within one upload
/// - `bits`: one packed row, MSB first
pub fn encode_line(
    depth: u8,
    power: u16,
    line_index: u16,
    bits: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let header = FrameHeader {
        opcode: Opcode::Line,
        payload_len: payload_len(bits)?,
        depth,
        power,
        line_index,
    };
    Ok(assemble(header, bits))
}

/// Decode and validate the 9-byte header at the start of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }

    let expected = checksum(&bytes[..LAYOUT.checksum]);
    let got = bytes[LAYOUT.checksum];
    if expected != got {
        return Err(CodecError::Checksum { expected, got });
    }

    Ok(FrameHeader {
        opcode: Opcode::try_from(bytes[LAYOUT.opcode])?,
        payload_len: get_u16(bytes, LAYOUT.length),
        depth: bytes[LAYOUT.depth],
        power: get_u16(bytes, LAYOUT.power),
        line_index: get_u16(bytes, LAYOUT.line),
    })
}

/// Decode one complete frame. The declared payload length must match the
/// bytes that follow the header exactly.
pub fn decode_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    let header = decode_header(bytes)?;
    let payload = &bytes[HEADER_LEN..];
    let declared = header.payload_len as usize;
    if payload.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

/// Result of classifying a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ack,
    NotAck,
}

/// Only a single [`ACK`] byte is an acknowledgement. Anything else,
/// including nothing at all, is not.
pub fn decode_ack(bytes: &[u8]) -> AckStatus {
    match bytes {
        [ACK] => AckStatus::Ack,
        _ => AckStatus::NotAck,
    }
}

/// Burn progress status frame as sent by the device.
pub fn encode_status(percent: u8) -> [u8; STATUS_FRAME_LEN] {
    [STATUS_PREFIX[0], STATUS_PREFIX[1], STATUS_PREFIX[2], percent.min(100)]
}

/// Recognize a `FF FF 00 <pct>` status frame.
pub fn decode_status(bytes: &[u8]) -> Option<u8> {
    match bytes {
        [a, b, c, pct] if [*a, *b, *c] == STATUS_PREFIX => Some((*pct).min(100)),
        _ => None,
    }
}

/// Firmware version from the three bytes following a status ACK.
pub fn decode_version(bytes: &[u8]) -> Result<String, CodecError> {
    match bytes {
        [major, minor, patch] => Ok(format!("v{major}.{minor}.{patch}")),
        _ => Err(CodecError::Truncated {
            needed: VERSION_LEN,
            got: bytes.len(),
        }),
    }
}

/// Picks status frames out of a byte stream that may carry stray bytes
/// (late ACKs, heartbeats).
#[derive(Debug, Default)]
pub struct StatusScanner {
    window: Vec<u8>,
}

impl StatusScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns the percentage once a full frame is seen.
    pub fn push(&mut self, byte: u8) -> Option<u8> {
        self.window.push(byte);
        if self.window.len() > STATUS_FRAME_LEN {
            self.window.remove(0);
        }
        let pct = decode_status(&self.window)?;
        self.window.clear();
        Some(pct)
    }

    /// Classify one byte read while a reply is awaited mid-burn, when status
    /// frames can arrive ahead of it. Bytes that extend a status frame are
    /// absorbed; anything else is handed back.
    pub fn absorb(&mut self, byte: u8) -> Interleaved {
        match STATUS_PREFIX.get(self.window.len()) {
            Some(expected) if *expected == byte => {
                self.window.push(byte);
                Interleaved::Partial
            }
            Some(_) => {
                self.window.clear();
                Interleaved::Other(byte)
            }
            None => {
                self.window.clear();
                Interleaved::Status(byte.min(100))
            }
        }
    }
}

/// What [`StatusScanner::absorb`] made of a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interleaved {
    /// Part of a status frame still arriving
    Partial,
    /// The last byte of a status frame, with its percentage
    Status(u8),
    /// Not status traffic
    Other(u8),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_checksum_sums_to_zero() {
        let bytes = [0x22, 0x00, 0x02, 0x64, 0x03, 0xE8, 0x00, 0x05];
        let sum = bytes
            .iter()
            .fold(checksum(&bytes), |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum, 0);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_line_header_layout() {
        let frame = encode_line(100, 1000, 5, &[0xFF, 0xC0]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 2);
        assert_eq!(frame[0], 0x22);
        assert_eq!(&frame[1..3], &[0x00, 0x02]);
        assert_eq!(frame[3], 100);
        assert_eq!(&frame[4..6], &[0x03, 0xE8]);
        assert_eq!(&frame[6..8], &[0x00, 0x05]);
        assert_eq!(frame[8], checksum(&frame[..8]));
        assert_eq!(&frame[9..], &[0xFF, 0xC0]);
    }

    #[test]
    fn test_header_fields_survive_decode() {
        let cases: [(u8, u16, u16, Vec<u8>); 4] = [
            (1, 0, 0, vec![]),
            (100, 1000, 9, vec![0xAA; 2]),
            (255, 1000, 1519, vec![0x01; 200]),
            (42, 500, 0x1234, vec![0x80]),
        ];
        for (depth, power, line, payload) in cases {
            let bytes = encode_line(depth, power, line, &payload).unwrap();
            let (header, body) = decode_frame(&bytes).unwrap();
            assert_eq!(
                header,
                FrameHeader {
                    opcode: Opcode::Line,
                    payload_len: payload.len() as u16,
                    depth,
                    power,
                    line_index: line,
                }
            );
            assert_eq!(body, payload.as_slice());
        }
    }

    #[test]
    fn test_control_frame_zeroes_burn_fields() {
        let bytes = encode_control(Opcode::Home, &[]).unwrap();
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header, FrameHeader::control(Opcode::Home, 0));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert_eq!(
            decode_header(&[0x22, 0x00]),
            Err(CodecError::Truncated { needed: 9, got: 2 })
        );
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut bytes = encode_line(100, 1000, 0, &[0xFF]).unwrap();
        bytes[3] = 99;
        assert!(matches!(
            decode_header(&bytes),
            Err(CodecError::Checksum { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = encode_line(100, 1000, 0, &[0xFF, 0x00]).unwrap();
        bytes.pop();
        assert_eq!(
            decode_frame(&bytes).map(|(h, _)| h),
            Err(CodecError::LengthMismatch {
                declared: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_payload_too_large() {
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            encode_line(1, 1000, 0, &big),
            Err(CodecError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_decode_ack() {
        assert_eq!(decode_ack(&[ACK]), AckStatus::Ack);
        assert_eq!(decode_ack(&[0x08]), AckStatus::NotAck);
        assert_eq!(decode_ack(&[]), AckStatus::NotAck);
        assert_eq!(decode_ack(&[ACK, ACK]), AckStatus::NotAck);
    }

    #[test]
    fn test_status_frames() {
        assert_eq!(encode_status(42), [0xFF, 0xFF, 0x00, 42]);
        assert_eq!(decode_status(&[0xFF, 0xFF, 0x00, 42]), Some(42));
        assert_eq!(decode_status(&[0xFF, 0xFF, 0xFF, 0xFE]), None);
        assert_eq!(decode_status(&[0xFF, 0xFF, 0x00]), None);
    }

    #[test]
    fn test_decode_version() {
        assert_eq!(decode_version(&[1, 2, 3]).unwrap(), "v1.2.3");
        assert!(decode_version(&[1, 2]).is_err());
    }

    #[test]
    fn test_scanner_skips_noise() {
        let mut scanner = StatusScanner::new();
        let stream = [ACK, 0xFF, 0xFF, 0xFF, 0xFE, 0xFF, 0xFF, 0x00, 25, 0xFF, 0xFF, 0x00, 50];
        let seen: Vec<u8> = stream.iter().filter_map(|b| scanner.push(*b)).collect();
        assert_eq!(seen, vec![25, 50]);
    }

    #[test]
    fn test_absorb_passes_ack_between_status_frames() {
        let mut scanner = StatusScanner::new();
        // pct 9 must not be mistaken for the ACK that follows it
        let stream = [0xFF, 0xFF, 0x00, 9, ACK];
        let seen: Vec<Interleaved> = stream.iter().map(|b| scanner.absorb(*b)).collect();
        assert_eq!(
            seen,
            vec![
                Interleaved::Partial,
                Interleaved::Partial,
                Interleaved::Partial,
                Interleaved::Status(9),
                Interleaved::Other(ACK),
            ]
        );
        assert_eq!(scanner.absorb(0xFF), Interleaved::Partial);
        assert_eq!(scanner.absorb(0x42), Interleaved::Other(0x42));
    }
}
