// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! USB-level types shared by the DFU programmer: DFU 1.1 requests, states and
//! statuses, and the DFU functional descriptor.

use num_enum::TryFromPrimitive;

use crate::error::ProtocolError;

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vid(pub u16);

/// Simple newtype struct for some clarity in function arguments and whatnot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u16);

/// Request numbers for DFU class requests.
///
/// \[[USB DFU Device Class Spec § 3](https://usb.org/sites/default/files/DFU_1.1.pdf)\]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DfuRequest
{
	Detach = 0,
	Dnload = 1,
	Upload = 2,
	GetStatus = 3,
	ClrStatus = 4,
	GetState = 5,
	Abort = 6,
}

/// States a DFU device can be in, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuState
{
	appIDLE = 0,
	appDETACH = 1,
	dfuIDLE = 2,
	dfuDNLOAD_SYNC = 3,
	dfuDNBUSY = 4,
	dfuDNLOAD_IDLE = 5,
	dfuMANIFEST_SYNC = 6,
	dfuMANIFEST = 7,
	dfuMANIFEST_WAIT_RESET = 8,
	dfuUPLOAD_IDLE = 9,
	dfuERROR = 10,
}

/// Status codes a DFU device can return, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DfuStatus
{
	OK = 0x00,
	errTARGET = 0x01,
	errFILE = 0x02,
	errWRITE = 0x03,
	errERASE = 0x04,
	errCHECK_ERASED = 0x05,
	errPROG = 0x06,
	errVERIFY = 0x07,
	errADDRESS = 0x08,
	errNOTDONE = 0x09,
	errFIRMWARE = 0x0a,
	errVENDOR = 0x0b,
	errUSBR = 0x0c,
	errPOR = 0x0d,
	errUNKNOWN = 0x0e,
	errSTALLEDPKT = 0x0f,
}

impl DfuStatus
{
	pub fn error_str(&self) -> &'static str
	{
		use DfuStatus::*;
		match self {
			OK => "No error condition is present.",
			errTARGET => "File is not targeted for use by this device.",
			errFILE => "File is for this device but fails some vendor-specific verification test.",
			errWRITE => "Device is unable to write memory.",
			errERASE => "Memory erase function failed.",
			errCHECK_ERASED => "Memory erase check failed.",
			errPROG => "Program memory function failed.",
			errVERIFY => "Programmed memory failed verification.",
			errADDRESS => "Cannot program memory due to received address that is out of range.",
			errNOTDONE => {
				"Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
			},
			errFIRMWARE => "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations.",
			errVENDOR => "iString indicates a vendor-specific error.",
			errUSBR => "Device detected unexpected USB reset signaling.",
			errPOR => "Device detected unexpected power on reset.",
			errUNKNOWN => "Something went wrong, but the device does not know what it was.",
			errSTALLEDPKT => "Device stalled an unexpected request.",
		}
	}
}

/// Structure of the DFU-class functional descriptor.
///
/// The descriptor contains `u16`s at uneven offsets, so it is decoded
/// per-field rather than overlaid on the wire bytes.
#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DfuFunctionalDescriptor
{
	pub bLength: u8, // Should be 0x09.
	pub bDescriptorType: u8, // Should be 0x21.
	pub bmAttributes: u8,
	pub wDetachTimeOut: u16,
	pub wTransferSize: u16,
	pub bcdDFUVersion: u16,
}

impl DfuFunctionalDescriptor
{
	pub const LENGTH: u8 = 0x09;
	pub const TYPE: u8 = 0x21;

	/// Constructs a [DfuFunctionalDescriptor] from the raw descriptor bytes, via per-field copy.
	pub fn from_bytes(bytes: &[u8; 0x09]) -> Result<Self, ProtocolError>
	{
		if bytes[0] != Self::LENGTH {
			return Err(ProtocolError::DescriptorMismatch {
				field: "bLength",
				provided: bytes[0],
				correct: Self::LENGTH,
			});
		}

		if bytes[1] != Self::TYPE {
			return Err(ProtocolError::DescriptorMismatch {
				field: "bDescriptorType",
				provided: bytes[1],
				correct: Self::TYPE,
			});
		}

		Ok(Self {
			bLength: bytes[0],
			bDescriptorType: bytes[1],
			bmAttributes: bytes[2],
			wDetachTimeOut: u16::from_le_bytes(bytes[3..=4].try_into().unwrap()),
			wTransferSize: u16::from_le_bytes(bytes[5..=6].try_into().unwrap()),
			bcdDFUVersion: u16::from_le_bytes(bytes[7..=8].try_into().unwrap()),
		})
	}
}
