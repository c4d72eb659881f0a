//! Host driver for an ESP32-based tRNS/tACS stimulation unit, with Python
//! bindings.
//!
//! The device speaks a small binary protocol over its USB CDC serial port:
//! length-delimited frames marked by `0xAA 0x55` and protected by CRC16, with
//! unsolicited diagnostic messages interleaved between command responses.
//! This crate implements the host side of that protocol — framing, CRC,
//! magic-byte resynchronization, command dispatch — plus the session-level
//! operations: status query, gain control, waveform preset upload, and
//! capture download.
//!
//! # Ordering
//!
//! The protocol carries no request identifiers. Keep exactly one command in
//! flight per device: one [`TrnsDevice`], one owner. The Rust API enforces
//! this through `&mut self`; from Python the GIL serializes calls on the
//! wrapper.

use std::time::Duration;

use pyo3::prelude::*;
use pyo3::types::PyDict;

mod device;
mod errors;
pub mod logging;
mod protocol;

pub use device::{
    sample_to_volts, DeviceEvent, DeviceStatus, Transport, TrnsDevice, BAUD_RATE, PRESET_SAMPLES,
};
pub use errors::{DriverError, Result};
pub use protocol::{crc16, encode, Command, FrameReader, Message, PROTOCOL_MAGIC};

// ============================================================================
// Python Bindings
// ============================================================================

fn to_py_err(e: DriverError) -> PyErr {
    use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
    match e {
        DriverError::InvalidGain(_) | DriverError::BadPresetLength { .. } => {
            PyValueError::new_err(e.to_string())
        }
        DriverError::Device(_) => PyRuntimeError::new_err(e.to_string()),
        _ => PyIOError::new_err(e.to_string()),
    }
}

/// Device status snapshot.
///
/// Attributes:
///     capture_sample_count: Samples accumulated in the capture ring buffer.
///     capture_rate_hz: Capture sampling rate in Hz.
///     gain: Output gain applied to the signal channel.
///     error_flags: Device-side error flags (0 = healthy).
///     preset_name: Name of the waveform preset currently playing.
#[pyclass(name = "DeviceStatus", frozen)]
#[derive(Clone)]
struct PyDeviceStatus {
    #[pyo3(get)]
    capture_sample_count: u32,
    #[pyo3(get)]
    capture_rate_hz: u16,
    #[pyo3(get)]
    gain: f32,
    #[pyo3(get)]
    error_flags: u8,
    #[pyo3(get)]
    preset_name: String,
}

#[pymethods]
impl PyDeviceStatus {
    fn __repr__(&self) -> String {
        format!(
            "DeviceStatus(preset='{}', gain={:.2}, samples={}, rate={}Hz, error_flags={:#04X})",
            self.preset_name,
            self.gain,
            self.capture_sample_count,
            self.capture_rate_hz,
            self.error_flags
        )
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("capture_sample_count", self.capture_sample_count)?;
        dict.set_item("capture_rate_hz", self.capture_rate_hz)?;
        dict.set_item("gain", self.gain)?;
        dict.set_item("error_flags", self.error_flags)?;
        dict.set_item("preset_name", self.preset_name.clone())?;
        Ok(dict)
    }

    /// True if the device reports any error flag.
    #[getter]
    fn has_errors(&self) -> bool {
        self.error_flags != 0
    }
}

impl From<DeviceStatus> for PyDeviceStatus {
    fn from(s: DeviceStatus) -> Self {
        PyDeviceStatus {
            capture_sample_count: s.capture_sample_count,
            capture_rate_hz: s.capture_rate_hz,
            gain: s.gain,
            error_flags: s.error_flags,
            preset_name: s.preset_name,
        }
    }
}

/// tRNS/tACS stimulation unit driver.
///
/// Opens the device's USB CDC serial port and exchanges framed commands with
/// it. One command is in flight at a time; responses are matched by order.
///
/// Example:
///     >>> device = TrnsDevice("/dev/ttyACM0")
///     >>> status = device.status()
///     >>> print(status.preset_name, status.gain)
///     >>> device.set_gain(1.5)
#[pyclass(name = "TrnsDevice", unsendable)]
struct PyTrnsDevice {
    inner: TrnsDevice,
    path: String,
}

#[pymethods]
impl PyTrnsDevice {
    /// Connect to the device via its serial port path (e.g. `/dev/ttyACM0`).
    ///
    /// Args:
    ///     path: Serial port of the device.
    ///     baud: Baud rate of the USB CDC link. Default: 921600.
    #[new]
    #[pyo3(signature = (path, baud=device::BAUD_RATE))]
    fn new(path: &str, baud: u32) -> PyResult<Self> {
        TrnsDevice::connect_with_baud(path, baud)
            .map(|inner| PyTrnsDevice {
                inner,
                path: path.to_string(),
            })
            .map_err(to_py_err)
    }

    /// Query the device status, including the active preset name.
    ///
    /// Returns:
    ///     DeviceStatus with capture counters, gain, error flags, and the
    ///     preset name.
    fn status(&mut self) -> PyResult<PyDeviceStatus> {
        self.inner.status().map(Into::into).map_err(to_py_err)
    }

    /// Set the output gain.
    ///
    /// Args:
    ///     gain: Any finite value >= 0.0. The device clamps the scaled signal
    ///         to the 16-bit range on its side.
    ///
    /// Raises:
    ///     ValueError: If the gain is negative or not finite (no I/O happens).
    ///     RuntimeError: If the device rejects the command.
    fn set_gain(&mut self, gain: f32) -> PyResult<()> {
        self.inner.set_gain(gain).map_err(to_py_err)
    }

    /// Read back the gain currently applied by the device.
    fn get_gain(&mut self) -> PyResult<f32> {
        self.inner.gain().map_err(to_py_err)
    }

    /// Upload a waveform preset.
    ///
    /// Args:
    ///     samples: Exactly 16000 mono samples (two seconds at 8 kHz) as
    ///         signed 16-bit integers.
    ///     name: Display name of the preset (e.g. "tACS 10Hz 1mA").
    ///
    /// Raises:
    ///     ValueError: If the buffer length is not exactly 16000.
    ///     RuntimeError: If the device rejects the upload.
    #[pyo3(signature = (samples, name="Custom preset"))]
    fn upload_preset(&mut self, samples: Vec<i16>, name: &str) -> PyResult<()> {
        self.inner.upload_preset(&samples, name).map_err(to_py_err)
    }

    /// Download the capture ring buffer.
    ///
    /// Returns:
    ///     List of signed 16-bit samples from the current-monitor ADC.
    fn capture(&mut self) -> PyResult<Vec<i16>> {
        self.inner.capture().map_err(to_py_err)
    }

    /// Reboot the device. The serial port typically re-enumerates afterwards.
    fn reset(&mut self) -> PyResult<()> {
        self.inner.reset().map_err(to_py_err)
    }

    /// Listen for unsolicited device traffic.
    ///
    /// Args:
    ///     duration: How long to listen, in seconds.
    ///     callback: Called as `callback(kind, value)` where kind is one of
    ///         "text", "status", "error". For "status" the value is a
    ///         DeviceStatus; otherwise it is the message string. Without a
    ///         callback, events are forwarded to logging.
    #[pyo3(signature = (duration=5.0, callback=None))]
    fn listen(
        &mut self,
        py: Python<'_>,
        duration: f64,
        callback: Option<Py<PyAny>>,
    ) -> PyResult<()> {
        let seconds = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
        let mut failure: Option<PyErr> = None;
        self.inner
            .listen(Duration::from_secs_f64(seconds), |event| {
                let Some(cb) = callback.as_ref() else {
                    log::info!("[device] {event:?}");
                    return;
                };
                if failure.is_some() {
                    return;
                }
                let result = match event {
                    DeviceEvent::Text(text) => cb.call1(py, ("text", text)),
                    DeviceEvent::Status(status) => {
                        cb.call1(py, ("status", PyDeviceStatus::from(status)))
                    }
                    DeviceEvent::Error(message) => cb.call1(py, ("error", message)),
                };
                if let Err(e) = result {
                    failure = Some(e);
                }
            })
            .map_err(to_py_err)?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn __repr__(&self) -> String {
        format!("TrnsDevice('{}')", self.path)
    }
}

/// CRC16-CCITT (poly 0x1021, init 0xFFFF) over `data`, as used by the frame
/// protocol. Handy for device-side tooling and protocol debugging.
#[pyfunction]
#[pyo3(name = "crc16")]
fn py_crc16(data: &[u8]) -> u16 {
    protocol::crc16(data)
}

/// Set the minimum level for driver logs forwarded into Python's `logging`
/// ("trace", "debug", "info", "warn", "error", "off"). With no argument the
/// level is re-read from `TRNS_LOG`/`RUST_LOG`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_class::<PyTrnsDevice>()?;
    m.add_class::<PyDeviceStatus>()?;
    m.add_function(wrap_pyfunction!(py_crc16, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    // Module-level constants
    m.add("PRESET_SAMPLES", device::PRESET_SAMPLES)?;
    m.add("DEFAULT_BAUD", device::BAUD_RATE)?;

    Ok(())
}
