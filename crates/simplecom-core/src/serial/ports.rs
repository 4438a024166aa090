//! Serial port enumeration
//!
//! Lists the devices a user can pick from, as `(id, label)` pairs.

use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;

/// An available serial device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Stable device identifier (e.g., "/dev/ttyUSB0" or "COM3")
    pub id: String,

    /// Human-readable description
    pub label: String,
}

impl PortDescriptor {
    fn bare(id: String) -> Self {
        Self {
            label: id.clone(),
            id,
        }
    }
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let label = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let name = usb
                    .product
                    .clone()
                    .or_else(|| usb.manufacturer.clone())
                    .unwrap_or_else(|| format!("USB Serial {:04X}:{:04X}", usb.vid, usb.pid));
                format!("{} ({})", name, info.port_name)
            }
            SerialPortType::BluetoothPort => format!("Bluetooth ({})", info.port_name),
            SerialPortType::PciPort => format!("PCI Serial ({})", info.port_name),
            SerialPortType::Unknown => info.port_name.clone(),
        };

        Self {
            id: info.port_name,
            label,
        }
    }
}

/// Device name prefixes in display order: USB CDC and USB-serial adapters
/// first, then Windows COM ports, then on-board UARTs
const PORT_PREFIXES: &[&str] = &[
    "ttyACM",
    "ttyUSB",
    "cu.usbmodem",
    "cu.usbserial",
    "COM",
    "ttyS",
];

/// Rank by prefix, then by the numeric suffix, then by name; unknown names last
fn port_sort_key(name: &str) -> (usize, u64, String) {
    let basename = name.rsplit(['/', '\\']).next().unwrap_or(name);
    PORT_PREFIXES
        .iter()
        .enumerate()
        .find_map(|(rank, prefix)| {
            let suffix = basename.strip_prefix(prefix)?;
            let digits: String = suffix.chars().take_while(char::is_ascii_digit).collect();
            let number = digits.parse().unwrap_or(u64::MAX);
            Some((rank, number, basename.to_string()))
        })
        .unwrap_or_else(|| (PORT_PREFIXES.len(), 0, basename.to_string()))
}

/// List all available serial ports in a deterministic order
///
/// Enumeration failures yield an empty list; a fresh snapshot is built on
/// every call.
pub fn list_ports() -> Vec<PortDescriptor> {
    let mut map: HashMap<String, PortDescriptor> = HashMap::new();
    match serialport::available_ports() {
        Ok(infos) => {
            for info in infos {
                let p = PortDescriptor::from(info);
                map.entry(p.id.clone()).or_insert(p);
            }
        }
        Err(e) => tracing::warn!("Port enumeration failed: {}", e),
    }

    // Linux-only: USB CDC/serial adapters the enumeration API sometimes misses
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortDescriptor::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortDescriptor> = map.into_values().collect();
    sort_ports(&mut ports);
    tracing::debug!("Found {} serial port(s)", ports.len());
    ports
}

fn sort_ports(ports: &mut [PortDescriptor]) {
    ports.sort_by_key(|p| port_sort_key(&p.id));
}
