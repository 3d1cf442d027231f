// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Discovery of candidate WireView serial ports.

use log::{debug, warn};
use serialport::SerialPortType;

use crate::protocol::SERIAL_VID_PID;

/// Lists the names of serial ports whose USB identity matches a WireView
/// Pro II in application mode, in stable (sorted) order.
///
/// Enumeration failure is not an error from the caller's point of view; an
/// empty list is returned and the supervisor simply rescans later.
pub fn candidate_ports() -> Vec<String>
{
	let ports = match serialport::available_ports() {
		Ok(ports) => ports,
		Err(e) => {
			warn!("serial port enumeration failed: {e}");
			return Vec::new();
		},
	};

	let mut names: Vec<String> = ports
		.into_iter()
		.filter(|port| {
			// Each device shows up as both /dev/cu.* and /dev/tty.* on
			// macOS; keep the cu.* one.
			#[cfg(target_os = "macos")]
			if port.port_name.starts_with("/dev/tty.") {
				return false;
			}

			match &port.port_type {
				SerialPortType::UsbPort(usb) => {
					usb.vid == SERIAL_VID_PID.0.0 && usb.pid == SERIAL_VID_PID.1.0
				},
				_ => false,
			}
		})
		.map(|port| port.port_name)
		.collect();

	names.sort();
	debug!("found {} candidate port(s): {names:?}", names.len());
	names
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn enumeration_never_panics()
	{
		// With or without hardware attached this must return cleanly.
		let _ = candidate_ports();
	}
}
