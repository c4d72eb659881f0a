use std::io;
use std::time::Duration;

use thiserror::Error;

/// Every way a driver operation can fail.
///
/// Framing errors carry enough context (byte counts, CRC values, kind bytes)
/// to diagnose a noisy link from the error message alone. Nothing here is
/// retried internally; the caller decides whether to reissue an operation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("frame start not found before deadline")]
    MagicTimeout,
    #[error("incomplete header: {got} of {expected} bytes")]
    IncompleteHeader { got: usize, expected: usize },
    #[error("incomplete payload: {got} of {expected} bytes")]
    IncompletePayload { got: usize, expected: usize },
    #[error("incomplete CRC: {got} of 2 bytes")]
    IncompleteCrc { got: usize },
    #[error("CRC mismatch: expected {expected:#06X}, received {received:#06X}")]
    CrcMismatch { expected: u16, received: u16 },
    #[error("declared payload length {len} exceeds the frame size limit")]
    PayloadTooLarge { len: u32 },
    #[error("unexpected response kind {kind:#04X} while waiting for {expected:#04X}")]
    UnexpectedKind { kind: u8, expected: u8 },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("device error: {0}")]
    Device(String),
    #[error("status payload too short: {len} of 11 fixed bytes")]
    ShortStatus { len: usize },
    #[error("malformed {what} payload: {len} bytes")]
    Malformed { what: &'static str, len: usize },
    #[error("gain must be finite and >= 0.0, got {0}")]
    InvalidGain(f32),
    #[error("preset must hold exactly {expected} samples, got {actual}")]
    BadPresetLength { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, DriverError>;
