//! Serial frame reassembly and classification
//!
//! The scanner/scale shares one serial line. Every frame is terminated by CR
//! (some firmware sends CRLF, so LF is a terminator too and empty frames are
//! skipped).
//!
//! Magellan frame grammar:
//! - Weight reply: `S11` followed by 4-6 ASCII digits, e.g. `S110045` → 45
//! - Scale status: `S14` followed by one digit (motion, over capacity, under zero, zero)
//! - Barcode: 1-64 printable ASCII characters (0x21-0x7E), so Code 39/128
//!   symbols with `-`, `.`, `/` and the like pass through
//!
//! Hardware variants differ, so classification sits behind [`FrameParser`].

use chrono::{DateTime, Utc};
use std::time::Instant;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Upper bound on a buffered frame. A longer line is flushed once, truncated,
/// so the parser rejects it; the rest of that line is discarded up to its
/// terminator.
pub const MAX_FRAME_LEN: usize = 128;

/// One delimiter-terminated chunk of serial input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub bytes: Vec<u8>,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
}

impl SerialFrame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, received_at: Instant::now(), received_wall: Utc::now() }
    }
}

/// Reassembles frames split across read boundaries
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    max_len: usize,
    /// Inside the tail of an oversized line
    discarding: bool,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    pub fn new(max_len: usize) -> Self {
        Self { buffer: Vec::with_capacity(max_len), max_len, discarding: false }
    }

    /// Feed raw bytes, returning every frame they complete.
    /// Trailing bytes without a terminator stay buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<SerialFrame> {
        let mut frames = Vec::new();

        for &byte in data {
            if byte == CR || byte == LF {
                self.discarding = false;
                if !self.buffer.is_empty() {
                    frames.push(SerialFrame::new(std::mem::take(&mut self.buffer)));
                }
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buffer.push(byte);
            if self.buffer.len() >= self.max_len {
                tracing::debug!(len = self.buffer.len(), "serial_frame_overflow");
                frames.push(SerialFrame::new(std::mem::take(&mut self.buffer)));
                self.discarding = true;
            }
        }

        frames
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame (after reconnect the tail is meaningless)
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

/// Outcome of classifying one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Barcode(String),
    /// Raw integer, not yet divided
    Weight(u64),
    ScaleStatus(u8),
    Malformed(&'static str),
}

/// Pluggable frame grammar
pub trait FrameParser: Send + Sync {
    fn classify(&self, frame: &[u8]) -> Classified;
}

/// Magellan scanner/scale (SASI/SCI-style replies)
#[derive(Debug, Clone)]
pub struct MagellanParser {
    weight_prefix: Vec<u8>,
    status_prefix: Vec<u8>,
    weight_digits: std::ops::RangeInclusive<usize>,
    max_barcode_len: usize,
}

impl Default for MagellanParser {
    fn default() -> Self {
        Self {
            weight_prefix: b"S11".to_vec(),
            status_prefix: b"S14".to_vec(),
            weight_digits: 4..=6,
            max_barcode_len: 64,
        }
    }
}

impl MagellanParser {
    fn parse_weight(&self, digits: &[u8]) -> Classified {
        if !self.weight_digits.contains(&digits.len()) {
            return Classified::Malformed("weight_width");
        }
        if !digits.iter().all(u8::is_ascii_digit) {
            return Classified::Malformed("weight_not_numeric");
        }
        // All ASCII digits, at most 6 of them: fits in u64
        let raw = digits.iter().fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
        Classified::Weight(raw)
    }
}

impl FrameParser for MagellanParser {
    fn classify(&self, frame: &[u8]) -> Classified {
        let frame = frame.trim_ascii();
        if frame.is_empty() {
            return Classified::Malformed("empty");
        }

        if let Some(digits) = frame.strip_prefix(self.weight_prefix.as_slice()) {
            return self.parse_weight(digits);
        }

        if let Some(code) = frame.strip_prefix(self.status_prefix.as_slice()) {
            return match code {
                [d] if d.is_ascii_digit() => Classified::ScaleStatus(d - b'0'),
                _ => Classified::Malformed("scale_status"),
            };
        }

        if frame.len() > self.max_barcode_len {
            return Classified::Malformed("too_long");
        }
        if !frame.iter().all(u8::is_ascii_graphic) {
            return Classified::Malformed("barcode_charset");
        }

        // Checked ASCII above
        Classified::Barcode(String::from_utf8_lossy(frame).into_owned())
    }
}
