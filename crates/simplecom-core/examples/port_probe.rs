//! Serial port probe
//!
//! Opens a port, sends one command and prints the timestamped replies.
//!
//! Usage:
//!   cargo run --example port_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: first one found)
//!   --baud RATE       Baud rate (default: 115200)
//!   --cmd TEXT        Command to send (default: AT)
//!   --ending MODE     None, CR, LF or CR+LF (default: CR+LF)
//!   --wait MS         How long to listen after sending (default: 1000)

use std::sync::{Arc, Mutex};
use std::time::Duration;

use simplecom_core::prelude::*;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut port_name: Option<String> = None;
    let mut baud_rate = 115200u32;
    let mut command = "AT".to_string();
    let mut ending = LineEnding::CrLf;
    let mut wait_ms = 1000u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                port_name = Some(args[i + 1].clone());
                i += 1;
            }
            "--baud" if i + 1 < args.len() => {
                baud_rate = args[i + 1].parse().unwrap_or(115200);
                i += 1;
            }
            "--cmd" if i + 1 < args.len() => {
                command = args[i + 1].clone();
                i += 1;
            }
            "--ending" if i + 1 < args.len() => {
                ending = args[i + 1].parse().unwrap_or_default();
                i += 1;
            }
            "--wait" if i + 1 < args.len() => {
                wait_ms = args[i + 1].parse().unwrap_or(1000);
                i += 1;
            }
            arg if !arg.starts_with("--") => port_name = Some(arg.to_string()),
            _ => {}
        }
        i += 1;
    }

    println!("=== SimpleCom Port Probe ===");
    let ports = list_ports();
    for port in &ports {
        println!("  {:<20} {}", port.id, port.label);
    }

    let Some(port_name) = port_name.or_else(|| ports.first().map(|p| p.id.clone())) else {
        eprintln!("No serial ports found");
        std::process::exit(1);
    };
    println!("Port: {}  Baud: {}  Ending: {}", port_name, baud_rate, ending);

    let channel = Arc::new(SerialChannel::default());
    let supervisor = ConnectionSupervisor::new(Arc::clone(&channel));
    let stamper = Mutex::new(ReceiveStamper::new());
    supervisor.subscribe(move |event| match event {
        SerialEvent::DataReceived(bytes) => {
            print!("{}", stamper.lock().unwrap().push_bytes(bytes));
        }
        SerialEvent::Error(msg) => eprintln!("Error: {}", msg),
        SerialEvent::ConnectionChanged(_) => {}
    });

    if let Err(e) = supervisor.connect(ConnectionConfig::new(port_name.as_str(), baud_rate)) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    println!("\n>>> {}", command);
    let started = std::time::Instant::now();
    if let Err(e) = channel.write(&ending.frame(&command)) {
        eprintln!("{}", e);
    }
    std::thread::sleep(Duration::from_millis(wait_ms));
    supervisor.disconnect();

    let counters = channel.counters();
    println!(
        "\n<<< done in {:?}: {} bytes sent, {} bytes received",
        started.elapsed(),
        counters.tx_bytes,
        counters.rx_bytes
    );
}
