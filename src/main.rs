use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;

mod device;
mod errors;
mod protocol;

use device::{DeviceEvent, TrnsDevice};

#[derive(Parser, Debug)]
#[command(name = "trns-demo", about = "Query and exercise a tRNS/tACS stimulation unit")]
struct Args {
    /// Serial port of the device (e.g. /dev/ttyACM0)
    port: String,
    /// Baud rate of the USB CDC link
    #[arg(long, default_value_t = device::BAUD_RATE)]
    baud: u32,
    /// Print the device status as JSON
    #[arg(long)]
    json: bool,
    /// Set the output gain before reading it back
    #[arg(long)]
    gain: Option<f32>,
    /// Download the capture buffer and print summary statistics
    #[arg(long)]
    capture: bool,
    /// After the status query, listen for diagnostics this many seconds
    #[arg(long, default_value_t = 0.0)]
    listen: f64,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    println!("Connecting to {} at {} baud...", args.port, args.baud);
    let mut device = TrnsDevice::connect_with_baud(&args.port, args.baud)
        .with_context(|| format!("failed to open {}", args.port))?;

    let status = device.status().context("status query failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Preset:   '{}'", status.preset_name);
        println!("Gain:     {:.2}", status.gain);
        println!(
            "Capture:  {} samples @ {} Hz",
            status.capture_sample_count, status.capture_rate_hz
        );
        println!("Errors:   {:#04X}", status.error_flags);
    }

    if let Some(gain) = args.gain {
        device.set_gain(gain).context("set_gain failed")?;
    }
    let gain = device.gain().context("gain query failed")?;
    println!("Device reports gain {gain:.2}");

    if args.capture {
        let samples = device.capture().context("capture download failed")?;
        let mean =
            samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len().max(1) as f64;
        let min = samples.iter().copied().min().unwrap_or(0);
        let max = samples.iter().copied().max().unwrap_or(0);
        println!(
            "Capture: {} samples, mean {:.1} ({:.3} V), min {}, max {}",
            samples.len(),
            mean,
            device::sample_to_volts(mean as f32),
            min,
            max
        );
    }

    if args.listen > 0.0 {
        println!("Listening for diagnostics ({:.1}s)...", args.listen);
        device.listen(Duration::from_secs_f64(args.listen), |event| match event {
            DeviceEvent::Text(text) => println!("[LOG] {text}"),
            DeviceEvent::Status(status) => println!(
                "[STATUS] preset '{}', gain {:.2}",
                status.preset_name, status.gain
            ),
            DeviceEvent::Error(message) => println!("[ERROR] {message}"),
        })?;
    }

    println!("Done.");
    Ok(())
}
