// Motor bridge diagnostic: READ-ONLY check of the serial link
//
// Nothing is written to the motors, so the wheels never move.
// Run this before pointing the runtime at a real bridge.
//
// Usage: cargo run --example bridge_diagnostic -- [port] [bridge id]
// Example: cargo run --example bridge_diagnostic -- /dev/ttyUSB0 1

use omnibase_zenoh_runtime::motor::MotorBridge;
use omnibase_zenoh_runtime::motor::bridge::{DEFAULT_BAUDRATE, DEFAULT_BRIDGE_ID};
use omnibase_zenoh_runtime::motor::kinematics::WHEEL_NAMES;
use std::thread;
use std::time::Duration;

const SAMPLES: usize = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let id = match args.next() {
        Some(raw) => raw.parse::<u8>()?,
        None => DEFAULT_BRIDGE_ID,
    };

    println!("=== Motor Bridge Diagnostic (READ-ONLY) ===");
    println!("Serial port: {} @ {} baud", port, DEFAULT_BAUDRATE);
    println!("Bridge id:   {}", id);
    println!();

    println!("Step 1: Opening serial port...");
    let mut bridge = match MotorBridge::open_with(&port, DEFAULT_BAUDRATE, id) {
        Ok(bridge) => {
            println!("  ✓ Serial port opened");
            bridge
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the USB cable is connected");
            println!("  - On Linux, make sure your user is in the dialout group");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Pinging bridge...");
    match bridge.ping() {
        Ok(true) => println!("  ✓ RESPONDING"),
        Ok(false) => {
            println!("  ✗ NO RESPONSE (check power and bridge id)");
            return Ok(());
        }
        Err(e) => {
            println!("  ✗ ERROR: {}", e);
            return Err(e.into());
        }
    }
    match bridge.firmware_version() {
        Ok(version) => println!("  Firmware: v{}", version),
        Err(e) => println!("  Firmware: ERROR - {}", e),
    }
    println!();

    println!("Step 3: Reading wheel rates ({} samples)...", SAMPLES);
    for sample in 0..SAMPLES {
        match bridge.read_wheel_rates() {
            Ok(rates) => {
                let line: Vec<String> = WHEEL_NAMES
                    .iter()
                    .zip(rates.as_array())
                    .map(|(name, rps)| format!("{}={:+.3}", name, rps))
                    .collect();
                println!("  [{}] {} rev/s", sample, line.join("  "));
            }
            Err(e) => println!("  [{}] ERROR - {}", sample, e),
        }
        thread::sleep(Duration::from_millis(200));
    }
    println!();

    println!("Diagnostic complete.");
    println!("Wheel rates should read near 0 while the wheels are stationary.");
    println!("Next step: run the runtime with --port {} and wheels OFF THE GROUND", port);

    Ok(())
}
