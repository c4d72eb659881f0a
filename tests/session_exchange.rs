//! End-to-end command/response exchanges over a scripted byte channel.
//!
//! These tests drive the public session API the way an application would,
//! with the device side replayed from pre-encoded frames.

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use _core::{encode, Command, DeviceEvent, DeviceStatus, Message, TrnsDevice};

/// Byte channel that replays a script of device frames and records writes.
struct ScriptedLink {
    rx: Cursor<Vec<u8>>,
    tx: Arc<Mutex<Vec<u8>>>,
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn scripted_device(frames: &[Vec<u8>]) -> (TrnsDevice, Arc<Mutex<Vec<u8>>>) {
    let tx = Arc::new(Mutex::new(Vec::new()));
    let link = ScriptedLink {
        rx: Cursor::new(frames.concat()),
        tx: Arc::clone(&tx),
    };
    (TrnsDevice::from_transport(Box::new(link)), tx)
}

fn status_payload(count: u32, rate: u16, gain: f32, flags: u8, name: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&count.to_le_bytes());
    payload.extend_from_slice(&rate.to_le_bytes());
    payload.extend_from_slice(&gain.to_le_bytes());
    payload.push(flags);
    payload.extend_from_slice(name.as_bytes());
    payload
}

#[test]
fn status_query_with_boot_banner() {
    // The device chats before answering; the banner must reach the log side
    // channel, not the caller.
    let (mut device, tx) = scripted_device(&[
        encode(Message::Text as u8, b"[boot] ready"),
        encode(
            Message::Status as u8,
            &status_payload(16000, 8000, 1.0, 0, "tACS 10Hz 1mA"),
        ),
    ]);

    let status = device.status().unwrap();
    assert_eq!(
        status,
        DeviceStatus {
            capture_sample_count: 16000,
            capture_rate_hz: 8000,
            gain: 1.0,
            error_flags: 0,
            preset_name: "tACS 10Hz 1mA".into(),
        }
    );
    assert_eq!(*tx.lock().unwrap(), encode(Command::GetStatus as u8, &[]));
}

#[test]
fn gain_change_and_readback() {
    let (mut device, tx) = scripted_device(&[
        encode(Message::Ack as u8, &[]),
        encode(Message::Text as u8, b"GAIN: Current gain = 1.50"),
        encode(Message::Ack as u8, &1.5f32.to_le_bytes()),
    ]);

    device.set_gain(1.5).unwrap();
    assert_eq!(device.gain().unwrap(), 1.5);

    let mut expected = encode(Command::SetGain as u8, &1.5f32.to_le_bytes());
    expected.extend(encode(Command::GetGain as u8, &[]));
    assert_eq!(*tx.lock().unwrap(), expected);
}

#[test]
fn diagnostics_listen_window() {
    let (mut device, tx) = scripted_device(&[
        encode(Message::Text as u8, b"[dac] preset loop armed"),
        encode(Message::Error as u8, b"overcurrent"),
    ]);

    let mut events = Vec::new();
    device
        .listen(Duration::from_millis(50), |event| events.push(event))
        .unwrap();

    assert_eq!(
        events,
        vec![
            DeviceEvent::Text("[dac] preset loop armed".into()),
            DeviceEvent::Error("overcurrent".into()),
        ]
    );
    // Listening never writes to the device.
    assert!(tx.lock().unwrap().is_empty());
}
