//! Binary frame protocol spoken on the stimulation unit's USB serial link.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! ┌───────────┬──────────┬─────────┬─────────┬───────┐
//! │ Magic (2) │ Kind (1) │ Len (4) │ Payload │ CRC16 │
//! └───────────┴──────────┴─────────┴─────────┴───────┘
//!   0xAA 0x55    1 byte     u32     N bytes    u16
//! ```
//!
//! The CRC covers kind, length, and payload — not the magic marker. Frames
//! from the device and commands to it share this envelope; the kind byte
//! tells them apart (responses 0x01-0x7F, commands 0x80-0xFF).
//!
//! The device emits diagnostic text frames whenever it pleases, so receivers
//! must be able to lock onto a frame boundary mid-stream: [`FrameReader`]
//! scans for the magic marker byte by byte and never gives up on noise, only
//! on its deadline.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{DriverError, Result};

/// Two-byte marker opening every frame.
pub const PROTOCOL_MAGIC: [u8; 2] = [0xAA, 0x55];

/// Frame header: kind byte plus u32 payload length.
pub const HEADER_LEN: usize = 5;

/// Upper bound accepted for a declared payload length. The largest real
/// frame is a capture download (~80 KB); anything near this ceiling means
/// the header bytes were garbage.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0x1021;

// ============================================================================
// Message and Command Kinds
// ============================================================================

/// Frame kinds the device sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Message {
    /// Human-readable diagnostic line, sent at any time.
    Text = 0x01,
    /// Capture ring buffer contents (signed 16-bit samples).
    CaptureData = 0x02,
    /// Status record plus trailing preset name.
    Status = 0x03,
    /// Command acknowledged; may carry a small result payload.
    Ack = 0x04,
    /// Command failed; payload is a UTF-8 message.
    Error = 0x05,
}

impl Message {
    /// Map a received kind byte to a known message kind.
    pub fn from_raw(kind: u8) -> Option<Self> {
        match kind {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::CaptureData),
            0x03 => Some(Self::Status),
            0x04 => Some(Self::Ack),
            0x05 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Commands the host sends to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Download the capture ring buffer.
    GetCapture = 0x82,
    /// Upload a waveform preset (sample block + name).
    SetWaveform = 0x83,
    /// Reserved; current firmware rejects it.
    #[allow(dead_code)]
    SetParams = 0x84,
    /// Query the status record.
    GetStatus = 0x85,
    /// Reboot the device.
    Reset = 0x86,
    /// Set the output gain (f32).
    SetGain = 0x88,
    /// Read back the output gain.
    GetGain = 0x89,
}

// ============================================================================
// Frame Codec
// ============================================================================

/// CRC16-CCITT (polynomial 0x1021, initial value 0xFFFF, MSB-first, no
/// final XOR) over `data`.
#[allow(dead_code)]
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(CRC_INIT, data)
}

/// Fold more bytes into a running CRC. Lets the header and payload be
/// checksummed without concatenating them into one buffer.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

fn header_bytes(kind: u8, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = kind;
    header[1..].copy_from_slice(&len.to_le_bytes());
    header
}

/// Encode one frame: magic, header, payload, CRC.
pub fn encode(kind: u8, payload: &[u8]) -> Vec<u8> {
    let header = header_bytes(kind, payload.len() as u32);
    let crc = crc16_update(crc16_update(CRC_INIT, &header), payload);

    let mut frame = Vec::with_capacity(PROTOCOL_MAGIC.len() + HEADER_LEN + payload.len() + 2);
    frame.extend_from_slice(&PROTOCOL_MAGIC);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Recompute the CRC for a received frame body and compare it against the
/// value that came over the wire.
pub fn validate_crc(kind: u8, payload: &[u8], received: u16) -> Result<()> {
    let header = header_bytes(kind, payload.len() as u32);
    let expected = crc16_update(crc16_update(CRC_INIT, &header), payload);
    if expected == received {
        Ok(())
    } else {
        Err(DriverError::CrcMismatch { expected, received })
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Reads one frame from a byte stream under a wall-clock deadline.
///
/// The deadline is a single budget for the whole frame: the magic scan, the
/// header, the payload, and the CRC all draw from it. Stream noise and
/// partial reads never abort a read attempt — only the deadline does, and
/// each shortfall is reported as a distinct error.
pub struct FrameReader<'a, R: Read + ?Sized> {
    stream: &'a mut R,
    deadline: Instant,
}

impl<'a, R: Read + ?Sized> FrameReader<'a, R> {
    pub fn new(stream: &'a mut R, deadline: Instant) -> Self {
        Self { stream, deadline }
    }

    /// Convenience over [`FrameReader::new`] for a budget starting now.
    #[allow(dead_code)]
    pub fn with_timeout(stream: &'a mut R, timeout: Duration) -> Self {
        Self::new(stream, Instant::now() + timeout)
    }

    /// Read the next well-formed frame, returning its kind and payload.
    pub fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        self.seek_magic()?;

        let mut header = [0u8; HEADER_LEN];
        let got = self.fill(&mut header)?;
        if got < HEADER_LEN {
            return Err(DriverError::IncompleteHeader {
                got,
                expected: HEADER_LEN,
            });
        }
        let kind = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if len > MAX_PAYLOAD_LEN {
            return Err(DriverError::PayloadTooLarge { len });
        }

        let mut payload = vec![0u8; len as usize];
        let got = self.fill(&mut payload)?;
        if got < payload.len() {
            return Err(DriverError::IncompletePayload {
                got,
                expected: payload.len(),
            });
        }

        let mut crc = [0u8; 2];
        let got = self.fill(&mut crc)?;
        if got < crc.len() {
            return Err(DriverError::IncompleteCrc { got });
        }
        let received = u16::from_le_bytes(crc);

        if let Err(e) = validate_crc(kind, &payload, received) {
            warn!("rejecting frame kind {kind:#04X}: {e}");
            return Err(e);
        }
        debug!("frame kind {kind:#04X}, {} payload bytes", payload.len());
        Ok((kind, payload))
    }

    /// Scan byte by byte until the two magic bytes arrive back to back.
    ///
    /// An `0xAA` arms the scanner; the next byte either completes the marker
    /// (`0x55`), re-arms it (another `0xAA`), or drops back to scanning.
    /// A stream like `AA AA 55 ...` therefore still locks onto the frame.
    fn seek_magic(&mut self) -> Result<()> {
        let mut armed = false;
        let mut consumed = 0usize;
        loop {
            let Some(byte) = self.read_byte()? else {
                if consumed > 0 {
                    debug!("no frame start in {consumed} bytes before deadline");
                }
                return Err(DriverError::MagicTimeout);
            };
            consumed += 1;
            if armed && byte == PROTOCOL_MAGIC[1] {
                if consumed > 2 {
                    debug!("resynchronized after {} stray bytes", consumed - 2);
                }
                return Ok(());
            }
            armed = byte == PROTOCOL_MAGIC[0];
        }
    }

    /// One byte, or `None` once the deadline has passed without one.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if recoverable(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= self.deadline {
                return Ok(None);
            }
        }
    }

    /// Fill `buf` from the stream, stopping early only at the deadline.
    /// Returns how many bytes actually arrived.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if recoverable(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if filled < buf.len() && Instant::now() >= self.deadline {
                break;
            }
        }
        Ok(filled)
    }
}

/// Read outcomes that mean "no data yet", not "the stream is broken". The
/// serial port's own timeout surfaces as `TimedOut`; it is the poll slice,
/// while our deadline is the budget.
fn recoverable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TEST_TIMEOUT: Duration = Duration::from_millis(50);

    fn read_one(bytes: &[u8]) -> Result<(u8, Vec<u8>)> {
        let mut stream = Cursor::new(bytes.to_vec());
        FrameReader::with_timeout(&mut stream, TEST_TIMEOUT).read_frame()
    }

    #[test]
    fn crc16_known_vectors() {
        // CRC-16/CCITT-FALSE leaves the initial value untouched on empty input.
        assert_eq!(crc16(b""), 0xFFFF);
        assert_eq!(crc16(b"A"), 0xB915);
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn frame_round_trip() {
        let payload = b"hello device".to_vec();
        let (kind, decoded) = read_one(&encode(Message::Text as u8, &payload)).unwrap();
        assert_eq!(kind, Message::Text as u8);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn empty_payload_round_trip() {
        let (kind, decoded) = read_one(&encode(Message::Ack as u8, &[])).unwrap();
        assert_eq!(kind, Message::Ack as u8);
        assert!(decoded.is_empty());
    }

    #[test]
    fn encode_layout_matches_wire_format() {
        let frame = encode(0x03, &[0xDE, 0xAD]);
        assert_eq!(&frame[..2], &PROTOCOL_MAGIC);
        assert_eq!(frame[2], 0x03);
        assert_eq!(&frame[3..7], &2u32.to_le_bytes());
        assert_eq!(&frame[7..9], &[0xDE, 0xAD]);
        assert_eq!(frame.len(), 11);
        let crc = u16::from_le_bytes([frame[9], frame[10]]);
        assert_eq!(crc, crc16(&frame[2..9]));
    }

    #[test]
    fn corrupted_body_bits_fail_crc() {
        let frame = encode(Message::Status as u8, b"corruption target");
        // Kind byte, payload bytes, CRC bytes: every single-bit flip must be
        // caught by the CRC check.
        let mut targets = vec![2usize];
        targets.extend(7..frame.len());
        for byte_index in targets {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte_index] ^= 1 << bit;
                match read_one(&corrupted) {
                    Err(DriverError::CrcMismatch { .. }) => {}
                    other => panic!("flip of byte {byte_index} bit {bit}: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn corrupted_length_is_rejected() {
        let frame = encode(Message::Status as u8, b"corruption target"); // len = 17
        // High bit of the length field turns it absurd.
        let mut huge = frame.clone();
        huge[6] ^= 0x80;
        assert!(matches!(
            read_one(&huge),
            Err(DriverError::PayloadTooLarge { .. })
        ));
        // A modest increase runs past the end of the stream.
        let mut longer = frame.clone();
        longer[3] ^= 0x20; // 17 -> 49
        assert!(matches!(
            read_one(&longer),
            Err(DriverError::IncompletePayload { got: 19, expected: 49 })
        ));
    }

    #[test]
    fn resynchronizes_after_false_lead_byte() {
        // AA AA 55: the second AA must count as a fresh magic candidate.
        let mut stream_bytes = vec![0xAA];
        stream_bytes.extend(encode(Message::Ack as u8, &[]));
        let (kind, payload) = read_one(&stream_bytes).unwrap();
        assert_eq!(kind, Message::Ack as u8);
        assert!(payload.is_empty());
    }

    #[test]
    fn skips_leading_noise() {
        let mut stream_bytes = vec![0x00, 0x55, 0x12, 0xAA, 0x13, 0x37];
        stream_bytes.extend(encode(Message::Text as u8, b"ok"));
        let (kind, payload) = read_one(&stream_bytes).unwrap();
        assert_eq!(kind, Message::Text as u8);
        assert_eq!(payload, b"ok");
    }

    #[test]
    fn magic_timeout_on_garbage() {
        let result = read_one(&[0x55, 0x00, 0xAA, 0xAA, 0x13]);
        assert!(matches!(result, Err(DriverError::MagicTimeout)));
    }

    #[test]
    fn incomplete_header_reported() {
        let result = read_one(&[0xAA, 0x55, 0x03, 0x02, 0x00]);
        assert!(matches!(
            result,
            Err(DriverError::IncompleteHeader { got: 3, expected: 5 })
        ));
    }

    #[test]
    fn incomplete_crc_reported() {
        let frame = encode(Message::Ack as u8, &[]);
        let result = read_one(&frame[..frame.len() - 1]);
        assert!(matches!(result, Err(DriverError::IncompleteCrc { got: 1 })));
    }

    #[test]
    fn message_kinds_map_from_raw() {
        assert_eq!(Message::from_raw(0x01), Some(Message::Text));
        assert_eq!(Message::from_raw(0x02), Some(Message::CaptureData));
        assert_eq!(Message::from_raw(0x03), Some(Message::Status));
        assert_eq!(Message::from_raw(0x04), Some(Message::Ack));
        assert_eq!(Message::from_raw(0x05), Some(Message::Error));
        assert_eq!(Message::from_raw(0x82), None);
    }
}
