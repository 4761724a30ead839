//! Frame Reader
//!
//! Splits the serial byte stream into frames of the form
//!
//! ```text
//! STX | body | ETX | CRC hi (hex) | CRC lo (hex) | CR
//! ```
//!
//! The checksum is CRC-8 (polynomial 0xD5, init 0) over `STX..=ETX`,
//! transmitted as two ASCII hex digits. Anything that does not fit this
//! shape is reported as a [`FrameCorruption`] and the scanner resynchronizes
//! on the next STX.

use crate::control::{CR, ETX, STX};
use crate::error::ProtocolError;
use crate::MAX_FRAME_LEN;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Bytes pulled from the link per read call
const READ_CHUNK: usize = 256;

/// Calculate CRC-8 with polynomial 0xD5
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0xD5
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Wrap a body in STX/ETX, append the hex checksum and CR
pub(crate) fn seal(body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(body.len() + 5);
    bytes.push(STX);
    bytes.extend_from_slice(body);
    bytes.push(ETX);
    let checksum = crc8(&bytes);
    bytes.extend_from_slice(format!("{:02X}", checksum).as_bytes());
    bytes.push(CR);
    bytes
}

/// A checksum-verified frame as received from the device
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    bytes: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl RawFrame {
    /// Wrap already-framed bytes (STX through CR) without validating them
    pub fn new(bytes: Vec<u8>, received_at: DateTime<Utc>) -> Self {
        Self { bytes, received_at }
    }

    /// Build a correctly framed and checksummed frame around `body`
    pub fn from_body(body: &[u8], received_at: DateTime<Utc>) -> Self {
        Self::new(seal(body), received_at)
    }

    /// Full frame bytes, STX through CR
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes between STX and ETX
    pub fn body(&self) -> &[u8] {
        if self.bytes.len() < 5 {
            return &[];
        }
        &self.bytes[1..self.bytes.len() - 4]
    }

    /// When the reader completed this frame
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Why a candidate frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorruptionReason {
    /// CRC digits parsed but do not match the frame content
    ChecksumMismatch { expected: u8, actual: u8 },
    /// The two bytes before CR are not hex digits
    BadChecksumDigits,
    /// No ETX in the position required before the checksum
    MissingEtx,
    /// Frame exceeded [`MAX_FRAME_LEN`] without a CR
    Oversized,
    /// A new STX arrived before the current frame was terminated
    UnexpectedStart,
}

/// A discarded frame, reported so the caller can record it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameCorruption {
    pub reason: CorruptionReason,
    /// Bytes dropped, including noise skipped before the frame started
    pub discarded: usize,
}

/// Result of one [`FrameReader::next_frame`] call
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A well-formed frame
    Frame(RawFrame),
    /// A malformed frame was dropped; scanning continues
    Corrupted(FrameCorruption),
    /// The read timeout passed without data
    Idle,
    /// The link reported end of stream
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Searching,
    Accumulating,
}

/// Outcome of feeding one byte to the scanner
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Scanned {
    Frame(Vec<u8>),
    Corrupted(FrameCorruption),
}

/// Byte-at-a-time framing state machine over a fixed-size buffer
pub(crate) struct FrameScanner {
    state: ScanState,
    buffer: Box<[u8]>,
    len: usize,
    /// Noise bytes skipped while searching for STX
    skipped: usize,
}

impl FrameScanner {
    pub(crate) fn new() -> Self {
        Self {
            state: ScanState::Searching,
            buffer: vec![0u8; MAX_FRAME_LEN].into_boxed_slice(),
            len: 0,
            skipped: 0,
        }
    }

    fn begin(&mut self) {
        self.state = ScanState::Accumulating;
        self.buffer[0] = STX;
        self.len = 1;
    }

    fn corrupted(&mut self, reason: CorruptionReason, discarded: usize) -> Scanned {
        let discarded = discarded + self.skipped;
        self.skipped = 0;
        Scanned::Corrupted(FrameCorruption { reason, discarded })
    }

    /// Feed one byte; returns a result once a frame completes or is dropped
    pub(crate) fn push(&mut self, byte: u8) -> Option<Scanned> {
        match self.state {
            ScanState::Searching => {
                if byte == STX {
                    self.begin();
                } else {
                    self.skipped += 1;
                }
                None
            }
            ScanState::Accumulating => {
                if byte == STX {
                    let dropped = self.len;
                    let result = self.corrupted(CorruptionReason::UnexpectedStart, dropped);
                    self.begin();
                    return Some(result);
                }

                if self.len == self.buffer.len() {
                    let dropped = self.len + 1;
                    self.state = ScanState::Searching;
                    self.len = 0;
                    return Some(self.corrupted(CorruptionReason::Oversized, dropped));
                }

                self.buffer[self.len] = byte;
                self.len += 1;

                if byte != CR {
                    return None;
                }

                let frame_len = self.len;
                self.state = ScanState::Searching;
                self.len = 0;

                match validate(&self.buffer[..frame_len]) {
                    Ok(()) => {
                        if self.skipped > 0 {
                            trace!("Skipped {} noise bytes before frame", self.skipped);
                            self.skipped = 0;
                        }
                        Some(Scanned::Frame(self.buffer[..frame_len].to_vec()))
                    }
                    Err(reason) => Some(self.corrupted(reason, frame_len)),
                }
            }
        }
    }
}

/// Check marker placement and checksum of a complete STX..CR frame
fn validate(frame: &[u8]) -> Result<(), CorruptionReason> {
    // STX, ETX, two hex digits, CR
    if frame.len() < 5 {
        return Err(CorruptionReason::MissingEtx);
    }

    let etx_pos = frame.len() - 4;
    if frame[etx_pos] != ETX {
        return Err(CorruptionReason::MissingEtx);
    }

    let digits = &frame[etx_pos + 1..frame.len() - 1];
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(CorruptionReason::BadChecksumDigits);
    }
    let received = std::str::from_utf8(digits)
        .ok()
        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        .ok_or(CorruptionReason::BadChecksumDigits)?;

    let expected = crc8(&frame[..=etx_pos]);
    if received != expected {
        return Err(CorruptionReason::ChecksumMismatch {
            expected,
            actual: received,
        });
    }

    Ok(())
}

/// Reads frames from a serial link (or any async byte stream)
pub struct FrameReader<R> {
    link: R,
    read_timeout: Duration,
    scanner: FrameScanner,
    chunk: [u8; READ_CHUNK],
    chunk_pos: usize,
    chunk_len: usize,
    last_received: Option<DateTime<Utc>>,
}

impl<R> FrameReader<R> {
    /// Create a reader over `link`; each read waits at most `read_timeout`
    pub fn new(link: R, read_timeout: Duration) -> Self {
        Self {
            link,
            read_timeout,
            scanner: FrameScanner::new(),
            chunk: [0u8; READ_CHUNK],
            chunk_pos: 0,
            chunk_len: 0,
            last_received: None,
        }
    }

    /// Give back the underlying link
    pub fn into_inner(self) -> R {
        self.link
    }

    /// Receive timestamps never go backwards within one reader
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_received {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_received = Some(stamp);
        stamp
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Return the next frame, corruption report, idle tick or end of stream.
    ///
    /// An I/O failure on the link is returned as [`ProtocolError::LinkLost`].
    pub async fn next_frame(&mut self) -> Result<ReadOutcome, ProtocolError> {
        loop {
            while self.chunk_pos < self.chunk_len {
                let byte = self.chunk[self.chunk_pos];
                self.chunk_pos += 1;

                match self.scanner.push(byte) {
                    Some(Scanned::Frame(bytes)) => {
                        let received_at = self.stamp();
                        return Ok(ReadOutcome::Frame(RawFrame::new(bytes, received_at)));
                    }
                    Some(Scanned::Corrupted(corruption)) => {
                        debug!("Dropped corrupt frame: {:?}", corruption);
                        return Ok(ReadOutcome::Corrupted(corruption));
                    }
                    None => {}
                }
            }

            match tokio::time::timeout(self.read_timeout, self.link.read(&mut self.chunk)).await {
                Err(_) => return Ok(ReadOutcome::Idle),
                Ok(Ok(0)) => return Ok(ReadOutcome::EndOfStream),
                Ok(Ok(n)) => {
                    self.chunk_pos = 0;
                    self.chunk_len = n;
                }
                // Some serial drivers surface their own read timeout as an error
                Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => return Ok(ReadOutcome::Idle),
                Ok(Err(e)) => return Err(ProtocolError::LinkLost(e.to_string())),
            }
        }
    }
}

impl<R: AsyncWrite + Unpin> FrameReader<R> {
    /// Write a command to the device, bounded by `timeout`
    pub async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        let write = async {
            self.link.write_all(bytes).await?;
            self.link.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::WriteFailed(e.to_string())),
            Err(_) => Err(ProtocolError::Timeout(timeout.as_millis() as u64)),
        }
    }
}
