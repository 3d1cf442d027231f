// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Error types for the WireView host library.

use thiserror::Error;

use crate::usb::{DfuState, DfuStatus};

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors (I/O and protocol) a WireView operation can surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error
{
	/// Another process held `Global\Access_USB_Sensors` past the acquisition timeout.
	#[error("another process is holding the USB sensor lock")]
	PortBusy,

	/// The OS refused to open the serial port.
	#[error("serial port {port} could not be opened")]
	PortUnavailable
	{
		port: String,
		source: serialport::Error,
	},

	/// The welcome banner or vendor record did not identify a WireView Pro II.
	#[error("connected device is not a WireView Pro II")]
	WrongDevice,

	/// The operation requires a connected session.
	#[error("no device session is connected")]
	NotConnected,

	/// No device in DFU mode was found on the bus.
	#[error("no WireView device in DFU mode was found")]
	DeviceNotFound,

	/// DFU_GETSTATUS reported a non-OK status; fatal for the current programming pass.
	#[error("device reported DFU error {status:?} ({err}) in state {state:?}", err = .status.error_str())]
	Dfu
	{
		status: DfuStatus,
		state: DfuState,
	},

	/// The firmware image claims to be an ELF but cannot be used.
	#[error("firmware image rejected: {0}")]
	ImageFormat(String),

	/// A decoded record held a value the firmware must never produce.
	#[error("protocol error")]
	Protocol(#[from] ProtocolError),

	#[error("serial transport error")]
	Serial(#[from] serialport::Error),

	#[error("USB transfer error")]
	Usb(#[from] rusb::Error),

	#[error("I/O error")]
	Io(#[from] std::io::Error),
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError
{
	#[error("record needs {expected} bytes, got {actual}")]
	Truncated
	{
		expected: usize,
		actual: usize,
	},

	#[error("device reported DFU state ({0}) that is not in the DFU spec")]
	UnknownDfuState(u8),

	#[error("device reported DFU status ({0}) that is not in the DFU spec")]
	UnknownDfuStatus(u8),

	#[error("functional descriptor field mismatch: {field} is {provided:#04x}, expected {correct:#04x}")]
	DescriptorMismatch
	{
		field: &'static str,
		provided: u8,
		correct: u8,
	},

	#[error("log entry carries HpwrSense {0}, valid range is 0..=3")]
	BadHpwrSense(u8),
}
