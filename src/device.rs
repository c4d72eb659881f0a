//! Driver for the tRNS/tACS stimulation unit.
//!
//! This module provides the session-level API on top of the frame protocol:
//! status queries, gain control, preset upload, capture download, and a
//! diagnostics listener.
//!
//! # Ordering
//!
//! The protocol carries no request identifiers: the link is half-duplex with
//! exactly one command outstanding at a time, and responses are correlated to
//! commands purely by order. Every operation therefore takes `&mut self` —
//! one session object, one owner, one exchange in flight. Unsolicited
//! diagnostic frames may still arrive at any moment; the dispatch loop
//! absorbs them into the log stream instead of mistaking them for answers.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::{DriverError, Result};
use crate::protocol::{self, Command, FrameReader, Message};

// ============================================================================
// Constants
// ============================================================================

/// Default baud rate of the unit's USB CDC port.
pub const BAUD_RATE: u32 = 921_600;

/// Per-read poll slice for the serial port. The port wakes up this often so
/// the frame reader can re-check its overall deadline.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Budget for an ordinary command/response exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Budget for a capture download (an ~80 KB frame).
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for a preset upload (32 KB frame plus the device-side buffer swap).
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3);

/// Read slice used by [`TrnsDevice::listen`] between deadline checks.
const LISTEN_SLICE: Duration = Duration::from_millis(500);

/// A preset is exactly two seconds of mono signal at 8 kHz.
pub const PRESET_SAMPLES: usize = 16_000;

/// Fixed part of a status payload: u32 + u16 + f32 + u8.
const STATUS_FIXED_LEN: usize = 11;

/// Full-scale count and reference voltage of the capture ADC.
const ADC_FULL_SCALE: f32 = 4095.0;
const ADC_REF_VOLTS: f32 = 1.1;

// ============================================================================
// Data Types
// ============================================================================

/// Snapshot of the device state, as returned by [`TrnsDevice::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Samples accumulated in the capture ring buffer.
    pub capture_sample_count: u32,
    /// Capture sampling rate in Hz.
    pub capture_rate_hz: u16,
    /// Output gain currently applied to the signal channel.
    pub gain: f32,
    /// Device-side error flags (0 = healthy).
    pub error_flags: u8,
    /// Name of the waveform preset currently playing.
    pub preset_name: String,
}

impl DeviceStatus {
    /// Decode a status payload: an 11-byte packed record followed by the
    /// preset name, which runs to the end of the payload with no length
    /// prefix of its own.
    ///
    /// The name is a best-effort diagnostic field; invalid UTF-8 in it is
    /// replaced rather than failing the decode.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < STATUS_FIXED_LEN {
            return Err(DriverError::ShortStatus { len: payload.len() });
        }
        let capture_sample_count =
            u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let capture_rate_hz = u16::from_le_bytes([payload[4], payload[5]]);
        let gain = f32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
        let error_flags = payload[10];
        let preset_name = String::from_utf8_lossy(&payload[STATUS_FIXED_LEN..]).into_owned();

        Ok(Self {
            capture_sample_count,
            capture_rate_hz,
            gain,
            error_flags,
            preset_name,
        })
    }
}

/// Unsolicited traffic surfaced by [`TrnsDevice::listen`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Diagnostic log line from the device.
    Text(String),
    /// Status report, prompted or periodic.
    Status(DeviceStatus),
    /// Error report not tied to a command of ours.
    Error(String),
}

/// Convert a raw capture reading (12-bit ADC counts) to volts at the shunt.
#[allow(dead_code)]
pub fn sample_to_volts(raw: f32) -> f32 {
    raw / ADC_FULL_SCALE * ADC_REF_VOLTS
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different byte channels.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Driver
// ============================================================================

/// Session handle for one stimulation unit.
///
/// # Example
/// ```ignore
/// let mut device = TrnsDevice::connect("/dev/ttyACM0")?;
/// let status = device.status()?;
/// println!("preset '{}', gain {:.2}", status.preset_name, status.gain);
/// device.set_gain(1.5)?;
/// ```
pub struct TrnsDevice {
    transport: Box<dyn Transport>,
}

impl TrnsDevice {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the device's serial port (e.g. `/dev/ttyACM0`) at the default
    /// baud rate.
    #[allow(dead_code)]
    pub fn connect(path: &str) -> Result<Self> {
        Self::connect_with_baud(path, BAUD_RATE)
    }

    /// Open the device's serial port at an explicit baud rate.
    pub fn connect_with_baud(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud).timeout(POLL_TIMEOUT).open()?;
        debug!("opened {path} at {baud} baud");
        Ok(Self {
            transport: Box::new(port),
        })
    }

    /// Wrap an already-open byte channel (tests, TCP bridges).
    #[allow(dead_code)]
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    // ------------------------------------------------------------------------
    // Device Operations
    // ------------------------------------------------------------------------

    /// Query the device status, including the active preset name.
    pub fn status(&mut self) -> Result<DeviceStatus> {
        let payload =
            self.send_and_await(Command::GetStatus, &[], Message::Status, DEFAULT_TIMEOUT)?;
        let status = DeviceStatus::decode(&payload)?;
        debug!("device status: {status:?}");
        Ok(status)
    }

    /// Set the output gain.
    ///
    /// Any finite value >= 0.0 is accepted; the device clamps the scaled
    /// signal to the i16 range on its side. Invalid values are rejected here,
    /// before any bytes touch the wire.
    pub fn set_gain(&mut self, gain: f32) -> Result<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(DriverError::InvalidGain(gain));
        }
        self.send_and_await(
            Command::SetGain,
            &gain.to_le_bytes(),
            Message::Ack,
            DEFAULT_TIMEOUT,
        )?;
        info!("gain set to {gain:.2}");
        Ok(())
    }

    /// Read back the gain currently applied by the device.
    pub fn gain(&mut self) -> Result<f32> {
        let payload = self.send_and_await(Command::GetGain, &[], Message::Ack, DEFAULT_TIMEOUT)?;
        if payload.len() != 4 {
            return Err(DriverError::Malformed {
                what: "gain",
                len: payload.len(),
            });
        }
        Ok(f32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Upload a waveform preset: exactly [`PRESET_SAMPLES`] mono samples plus
    /// a display name.
    ///
    /// The payload is the raw sample block first, then the name bytes with no
    /// delimiter; the device splits them at the fixed 32000-byte mark. Buffers
    /// of any other length are rejected before any bytes are written.
    #[allow(dead_code)]
    pub fn upload_preset(&mut self, samples: &[i16], name: &str) -> Result<()> {
        if samples.len() != PRESET_SAMPLES {
            return Err(DriverError::BadPresetLength {
                expected: PRESET_SAMPLES,
                actual: samples.len(),
            });
        }
        let mut payload = Vec::with_capacity(PRESET_SAMPLES * 2 + name.len());
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        payload.extend_from_slice(name.as_bytes());

        info!(
            "uploading preset '{}' ({} samples, {} bytes)",
            name,
            samples.len(),
            payload.len()
        );
        self.send_and_await(Command::SetWaveform, &payload, Message::Ack, UPLOAD_TIMEOUT)?;
        Ok(())
    }

    /// Download the capture ring buffer from the current-monitor ADC.
    pub fn capture(&mut self) -> Result<Vec<i16>> {
        let payload = self.send_and_await(
            Command::GetCapture,
            &[],
            Message::CaptureData,
            CAPTURE_TIMEOUT,
        )?;
        if payload.len() % 2 != 0 {
            warn!(
                "capture payload has a stray trailing byte ({} bytes)",
                payload.len()
            );
        }
        let samples: Vec<i16> = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        debug!("capture: {} samples", samples.len());
        Ok(samples)
    }

    /// Reboot the device. The ACK arrives before the restart, so expect the
    /// port to go away shortly afterwards.
    #[allow(dead_code)]
    pub fn reset(&mut self) -> Result<()> {
        self.send_and_await(Command::Reset, &[], Message::Ack, DEFAULT_TIMEOUT)?;
        info!("device reset acknowledged");
        Ok(())
    }

    /// Tap the link for unsolicited traffic for `duration`.
    ///
    /// Text, status, and error frames are handed to `observer`. Quiet slices
    /// are not an error, and a malformed frame only logs a warning before the
    /// scan continues — this is a best-effort diagnostics tap, not a command
    /// exchange. I/O failures still propagate.
    pub fn listen<F>(&mut self, duration: Duration, mut observer: F) -> Result<()>
    where
        F: FnMut(DeviceEvent),
    {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            let slice_end = end.min(Instant::now() + LISTEN_SLICE);
            let mut reader = FrameReader::new(self.transport.as_mut(), slice_end);
            match reader.read_frame() {
                Ok((kind, payload)) => match Message::from_raw(kind) {
                    Some(Message::Text) => observer(DeviceEvent::Text(
                        String::from_utf8_lossy(&payload).into_owned(),
                    )),
                    Some(Message::Status) => match DeviceStatus::decode(&payload) {
                        Ok(status) => observer(DeviceEvent::Status(status)),
                        Err(e) => warn!("undecodable status frame: {e}"),
                    },
                    Some(Message::Error) => observer(DeviceEvent::Error(
                        String::from_utf8_lossy(&payload).into_owned(),
                    )),
                    _ => debug!("ignoring frame kind {kind:#04X} while listening"),
                },
                Err(DriverError::MagicTimeout) => {}
                Err(e @ (DriverError::Io(_) | DriverError::Serial(_))) => return Err(e),
                Err(e) => warn!("malformed frame while listening: {e}"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Command Dispatch
    // ------------------------------------------------------------------------

    /// Send one command frame and wait for a response of `expected` kind.
    ///
    /// Diagnostic text frames that arrive in between are logged and skipped;
    /// an error frame becomes [`DriverError::Device`]; any other kind ends the
    /// exchange as a desynchronization. The command is written exactly once —
    /// there is no retransmission at this layer, and `timeout` is the overall
    /// budget for the whole exchange.
    fn send_and_await(
        &mut self,
        command: Command,
        payload: &[u8],
        expected: Message,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let frame = protocol::encode(command as u8, payload);
        self.transport.write_all(&frame)?;
        self.transport.flush()?;
        debug!("sent {command:?} ({} payload bytes)", payload.len());

        let start = Instant::now();
        loop {
            if start.elapsed() >= timeout {
                return Err(DriverError::Timeout(timeout));
            }
            let mut reader = FrameReader::new(self.transport.as_mut(), start + timeout);
            let (kind, response) = match reader.read_frame() {
                Ok(frame) => frame,
                Err(DriverError::MagicTimeout) => continue,
                Err(e) => return Err(e),
            };

            if kind == Message::Text as u8 {
                info!("[device] {}", String::from_utf8_lossy(&response).trim_end());
                continue;
            }
            if kind == expected as u8 {
                return Ok(response);
            }
            if kind == Message::Error as u8 {
                return Err(DriverError::Device(
                    String::from_utf8_lossy(&response).into_owned(),
                ));
            }
            return Err(DriverError::UnexpectedKind {
                kind,
                expected: expected as u8,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
