// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! The WireView Pro II wire protocol: command opcodes, identity constants and
//! the packed records the firmware exchanges over its virtual serial port.
//!
//! Commands are a single opcode byte optionally followed by little-endian
//! operands; responses are fixed-size packed records whose length the host
//! knows per opcode. There is no framing, checksum or length field.

use std::fmt::Write as _;
use std::io::Cursor;

use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::{WireRecord, expect_len};
use crate::error::ProtocolError;
use crate::usb::{Pid, Vid};

/// VID/PID the device enumerates with in application (virtual serial) mode.
pub const SERIAL_VID_PID: (Vid, Pid) = (Vid(0x0483), Pid(0x5740));
/// VID/PID the device re-enumerates with after entering the DFU bootloader.
pub const DFU_VID_PID: (Vid, Pid) = (Vid(0x0483), Pid(0xdf11));

/// ASCII banner the device emits on RTS assertion (or on [`Command::Welcome`]).
pub const WELCOME_BANNER: &str = "Thermal Grizzly WireView Pro II";
/// Banner plus its terminating NUL, as read from the wire.
pub const WELCOME_LEN: usize = WELCOME_BANNER.len() + 1;

/// Number of raw bytes in the device's unique id.
pub const UID_LEN: usize = 12;

/// Size of the NUL-padded firmware build string.
pub const BUILD_INFO_LEN: usize = 32;

/// Size of the opaque configuration blob, fixed by the firmware.
pub const CONFIG_LEN: usize = 125;

/// Command opcodes understood by the firmware's serial dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command
{
	Welcome = 0x00,
	ReadVendorData = 0x01,
	ReadUid = 0x02,
	ReadSensorValues = 0x03,
	ReadBuildInfo = 0x04,
	ReadConfig = 0x05,
	WriteConfig = 0x06,
	NvmConfig = 0x07,
	ScreenChange = 0x08,
	ClearFaults = 0x09,
	Bootloader = 0x0a,
}

/// Guard bytes preceding the operand of [`Command::NvmConfig`], so a corrupt
/// or truncated write cannot accidentally touch non-volatile memory.
pub const NVM_MAGIC: [u8; 4] = [0x55, 0xaa, 0x55, 0xaa];

/// Non-volatile memory operations carried by [`Command::NvmConfig`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum NvmCommand
{
	/// Persist the active configuration.
	Save = 0x01,
	/// Reload the persisted configuration, discarding unsaved changes.
	Load = 0x02,
	/// Restore factory defaults.
	Defaults = 0x03,
}

/// Display operations carried by [`Command::ScreenChange`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum ScreenCommand
{
	PauseUpdates = 0x00,
	ResumeUpdates = 0x01,
	NextPage = 0x02,
	PreviousPage = 0x03,
}

/// Attached-PSU capability code as reported in [`SensorReadings`].
///
/// Codes 2..=5 are the four 12VHPWR sideband sense states offset by two;
/// 0 and 1 mean no PSU sense information is available.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum HpwrCapability
{
	NotDetected = 0,
	Unknown = 1,
	W150 = 2,
	W300 = 3,
	W450 = 4,
	W600 = 5,
}

impl HpwrCapability
{
	pub const fn watts(self) -> u32
	{
		match self {
			Self::NotDetected | Self::Unknown => 0,
			Self::W150 => 150,
			Self::W300 => 300,
			Self::W450 => 450,
			Self::W600 => 600,
		}
	}
}

/// Maps a raw capability code to watts; anything the firmware should not
/// produce maps to 0.
pub fn capability_watts(code: u8) -> u32
{
	HpwrCapability::try_from(code).map_or(0, HpwrCapability::watts)
}

/// Maps a 2-bit log-side HpwrSense code (0..=3) to watts.
pub const fn sense_watts(sense: u8) -> u32
{
	match sense {
		0 => 150,
		1 => 300,
		2 => 450,
		3 => 600,
		_ => 0,
	}
}

/// Renders a raw unique id as uppercase hex, the form shown to users.
pub fn format_uid(uid: &[u8; UID_LEN]) -> String
{
	let mut out = String::with_capacity(UID_LEN * 2);
	for byte in uid {
		// Writing to a String cannot fail.
		write!(out, "{byte:02X}").unwrap();
	}
	out
}

/// Vendor identification record, the first thing read after the welcome
/// banner. A genuine WireView Pro II always reports vendor 0xEF, product
/// 0x05; anything else fails the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VendorData
{
	pub vendor_id: u8,
	pub product_id: u8,
	pub firmware_version: u16,
}

impl VendorData
{
	pub const VENDOR_ID: u8 = 0xef;
	pub const PRODUCT_ID: u8 = 0x05;

	/// Whether this record identifies a device this library drives.
	pub fn is_wireview(&self) -> bool
	{
		self.vendor_id == Self::VENDOR_ID && self.product_id == Self::PRODUCT_ID
	}

	/// Hardware revision string as shown to users, e.g. `"EF05"`.
	pub fn hardware_revision(&self) -> String
	{
		format!("{:02X}{:02X}", self.vendor_id, self.product_id)
	}
}

impl WireRecord for VendorData
{
	const SIZE: usize = 4;

	fn encode(&self) -> Vec<u8>
	{
		let mut cursor = Cursor::new(Vec::with_capacity(Self::SIZE));
		cursor.write_u8(self.vendor_id).unwrap();
		cursor.write_u8(self.product_id).unwrap();
		cursor.write_u16::<LE>(self.firmware_version).unwrap();
		cursor.into_inner()
	}

	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>
	{
		expect_len(bytes, Self::SIZE)?;
		let mut cursor = Cursor::new(bytes);
		Ok(Self {
			vendor_id: cursor.read_u8().unwrap(),
			product_id: cursor.read_u8().unwrap(),
			firmware_version: cursor.read_u16::<LE>().unwrap(),
		})
	}
}

/// One channel of the six-channel voltage/current monitor, in millivolts
/// and milliamps.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PinReading
{
	pub voltage_mv: u16,
	pub current_ma: u16,
}

/// One telemetry snapshot as returned by [`Command::ReadSensorValues`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SensorReadings
{
	/// Temperature channels in tenths of a degree Celsius.
	pub ts: [i16; 4],
	pub pins: [PinReading; 6],
	/// Raw [`HpwrCapability`] code.
	pub hpwr_capability: u8,
	pub fault_status: u16,
	pub fault_log: u16,
}

impl WireRecord for SensorReadings
{
	const SIZE: usize = 4 * 2 + 6 * 4 + 1 + 2 + 2;

	fn encode(&self) -> Vec<u8>
	{
		let mut cursor = Cursor::new(Vec::with_capacity(Self::SIZE));
		for t in &self.ts {
			cursor.write_i16::<LE>(*t).unwrap();
		}
		for pin in &self.pins {
			cursor.write_u16::<LE>(pin.voltage_mv).unwrap();
			cursor.write_u16::<LE>(pin.current_ma).unwrap();
		}
		cursor.write_u8(self.hpwr_capability).unwrap();
		cursor.write_u16::<LE>(self.fault_status).unwrap();
		cursor.write_u16::<LE>(self.fault_log).unwrap();
		cursor.into_inner()
	}

	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>
	{
		expect_len(bytes, Self::SIZE)?;
		let mut cursor = Cursor::new(bytes);

		let mut ts = [0i16; 4];
		for t in &mut ts {
			*t = cursor.read_i16::<LE>().unwrap();
		}
		let mut pins = [PinReading::default(); 6];
		for pin in &mut pins {
			pin.voltage_mv = cursor.read_u16::<LE>().unwrap();
			pin.current_ma = cursor.read_u16::<LE>().unwrap();
		}

		Ok(Self {
			ts,
			pins,
			hpwr_capability: cursor.read_u8().unwrap(),
			fault_status: cursor.read_u16::<LE>().unwrap(),
			fault_log: cursor.read_u16::<LE>().unwrap(),
		})
	}
}

/// Firmware build information, a NUL-padded ASCII field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BuildInfo
{
	pub text: [u8; BUILD_INFO_LEN],
}

impl BuildInfo
{
	/// The build string with NUL padding and trailing garbage removed.
	pub fn as_str(&self) -> &str
	{
		let end = self.text.iter().position(|&b| b == 0).unwrap_or(BUILD_INFO_LEN);
		std::str::from_utf8(&self.text[..end]).unwrap_or("")
	}
}

impl WireRecord for BuildInfo
{
	const SIZE: usize = BUILD_INFO_LEN;

	fn encode(&self) -> Vec<u8>
	{
		self.text.to_vec()
	}

	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>
	{
		expect_len(bytes, Self::SIZE)?;
		let mut text = [0u8; BUILD_INFO_LEN];
		text.copy_from_slice(bytes);
		Ok(Self {
			text,
		})
	}
}

/// Device configuration. The layout is owned by the firmware; the host treats
/// it as an opaque blob that must round-trip byte-for-byte through
/// read/write when unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceConfig
{
	pub raw: [u8; CONFIG_LEN],
}

impl Default for DeviceConfig
{
	fn default() -> Self
	{
		Self {
			raw: [0u8; CONFIG_LEN],
		}
	}
}

impl WireRecord for DeviceConfig
{
	const SIZE: usize = CONFIG_LEN;

	fn encode(&self) -> Vec<u8>
	{
		self.raw.to_vec()
	}

	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>
	{
		expect_len(bytes, Self::SIZE)?;
		let mut raw = [0u8; CONFIG_LEN];
		raw.copy_from_slice(bytes);
		Ok(Self {
			raw,
		})
	}
}

/// Tag in the low two bits of a log entry header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum LogTag
{
	McuTick = 0,
	SystemTime = 1,
	PowerOn = 2,
	Empty = 3,
}

/// One pin reading inside a log entry, in tenths of a volt and tenths of
/// an ampere.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LogPin
{
	pub volts_dv: u8,
	pub amps_da: u8,
}

/// One fixed-size record in the device's on-board flash log.
///
/// The header packs a 2-bit [`LogTag`] in the low bits and a 30-bit MCU tick
/// (4 ms units) above it. Temperatures are whole degrees Celsius.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LogEntry
{
	pub header: u32,
	pub ts: [u8; 4],
	pub pins: [LogPin; 6],
	pub hpwr_sense: u8,
}

impl LogEntry
{
	/// Largest value the header's HpwrSense field may carry; anything above
	/// marks the entry as corrupt.
	pub const HPWR_SENSE_MAX: u8 = 3;

	pub fn tag(&self) -> LogTag
	{
		match (self.header & 0b11) as u8 {
			0 => LogTag::McuTick,
			1 => LogTag::SystemTime,
			2 => LogTag::PowerOn,
			3 => LogTag::Empty,
			_ => unreachable!(),
		}
	}

	/// The 30-bit payload above the tag: an MCU tick count for
	/// [`LogTag::McuTick`] entries.
	pub fn timestamp30(&self) -> u32
	{
		self.header >> 2
	}
}

impl WireRecord for LogEntry
{
	const SIZE: usize = 4 + 4 + 12 + 1;

	fn encode(&self) -> Vec<u8>
	{
		let mut cursor = Cursor::new(Vec::with_capacity(Self::SIZE));
		cursor.write_u32::<LE>(self.header).unwrap();
		for t in &self.ts {
			cursor.write_u8(*t).unwrap();
		}
		for pin in &self.pins {
			cursor.write_u8(pin.volts_dv).unwrap();
			cursor.write_u8(pin.amps_da).unwrap();
		}
		cursor.write_u8(self.hpwr_sense).unwrap();
		cursor.into_inner()
	}

	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>
	{
		expect_len(bytes, Self::SIZE)?;
		let mut cursor = Cursor::new(bytes);

		let header = cursor.read_u32::<LE>().unwrap();
		let mut ts = [0u8; 4];
		for t in &mut ts {
			*t = cursor.read_u8().unwrap();
		}
		let mut pins = [LogPin::default(); 6];
		for pin in &mut pins {
			pin.volts_dv = cursor.read_u8().unwrap();
			pin.amps_da = cursor.read_u8().unwrap();
		}

		Ok(Self {
			header,
			ts,
			pins,
			hpwr_sense: cursor.read_u8().unwrap(),
		})
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn vendor_data_identifies_wireview()
	{
		let vendor = VendorData::decode(&[0xef, 0x05, 0x03, 0x00]).unwrap();
		assert!(vendor.is_wireview());
		assert_eq!(vendor.firmware_version, 3);
		assert_eq!(vendor.hardware_revision(), "EF05");

		let other = VendorData::decode(&[0x00, 0x00, 0x00, 0x00]).unwrap();
		assert!(!other.is_wireview());
	}

	#[test]
	fn record_sizes_match_firmware_layout()
	{
		assert_eq!(VendorData::SIZE, 4);
		assert_eq!(SensorReadings::SIZE, 37);
		assert_eq!(LogEntry::SIZE, 21);
	}

	#[test]
	fn capability_ladder()
	{
		assert_eq!(capability_watts(2), 150);
		assert_eq!(capability_watts(3), 300);
		assert_eq!(capability_watts(4), 450);
		assert_eq!(capability_watts(5), 600);
		// Out-of-ladder codes degrade to 0 W rather than erroring.
		assert_eq!(capability_watts(0), 0);
		assert_eq!(capability_watts(1), 0);
		assert_eq!(capability_watts(0x7f), 0);
	}

	#[test]
	fn uid_renders_uppercase_hex()
	{
		let uid = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
		assert_eq!(format_uid(&uid), "00112233445566778899AABB");
	}

	#[test]
	fn log_entry_header_fields()
	{
		let entry = LogEntry {
			header: (250 << 2) | LogTag::McuTick as u32,
			ts: [30, 41, 0, 0],
			pins: [LogPin::default(); 6],
			hpwr_sense: 1,
		};
		assert_eq!(entry.tag(), LogTag::McuTick);
		assert_eq!(entry.timestamp30(), 250);

		let erased = LogEntry::decode(&[0xff; LogEntry::SIZE]).unwrap();
		assert_eq!(erased.tag(), LogTag::Empty);
	}

	#[test]
	fn build_info_trims_nul_padding()
	{
		let mut text = [0u8; BuildInfo::SIZE];
		text[..10].copy_from_slice(b"v3.1 REL  ");
		let info = BuildInfo {
			text,
		};
		assert_eq!(info.as_str(), "v3.1 REL  ");
	}
}
