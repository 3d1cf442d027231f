// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! DfuSe firmware programming over USB control transfers.
//!
//! After `CMD_BOOTLOADER` the device re-enumerates as an STM32 system
//! bootloader (VID 0x0483, PID 0xDF11) speaking DFU 1.1 with the DfuSe
//! extensions: DNLOAD block 0 is a command channel (SET_ADDRESS_POINTER),
//! data blocks start at 2, and an empty DNLOAD manifests the image.
//!
//! Reference: [DFU 1.1 Specification](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! and ST AN3156 for the DfuSe command set.

use std::time::Duration;

use log::{debug, info, trace};
use rusb::{Direction, Recipient, RequestType};

use crate::elf;
use crate::elf::Segment;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::DFU_VID_PID;
use crate::usb::{DfuFunctionalDescriptor, DfuRequest, DfuState, DfuStatus};

/// Flash base the bootloader maps application firmware at; flat binaries
/// load here.
pub const DEFAULT_LOAD_ADDRESS: u32 = 0x0800_0000;

/// DfuSe command byte for SET_ADDRESS_POINTER on block 0.
const SET_ADDRESS_POINTER: u8 = 0x21;

/// First data block number; 0 is the command channel and 1 is unused per
/// DfuSe.
const FIRST_DATA_BLOCK: u16 = 2;

/// Device-reported transfer sizes are clamped into this range.
const TRANSFER_SIZE_RANGE: (usize, usize) = (64, 4096);

/// Cap on the device-reported poll interval while busy.
const POLL_TIMEOUT_CAP: Duration = Duration::from_millis(1000);

/// USB control transfer timeout.
const USB_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded DFU_GETSTATUS response.
#[derive(Debug, Copy, Clone)]
pub struct StatusReport
{
	pub status: DfuStatus,
	/// Minimum wait the device requests before the next GETSTATUS, ms.
	pub poll_timeout: u32,
	pub state: DfuState,
}

impl StatusReport
{
	pub fn from_bytes(bytes: &[u8; 6]) -> std::result::Result<Self, ProtocolError>
	{
		Ok(Self {
			status: DfuStatus::try_from(bytes[0]).map_err(|e| ProtocolError::UnknownDfuStatus(e.number))?,
			poll_timeout: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]),
			state: DfuState::try_from(bytes[4]).map_err(|e| ProtocolError::UnknownDfuState(e.number))?,
		})
	}
}

/// Control-transfer access to a device in DFU mode; the seam tests use to
/// substitute a scripted bootloader.
pub trait DfuLink
{
	/// Class request, host to device. `value` is wValue (the block number
	/// for DNLOAD).
	fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()>;

	/// Class request, device to host. Returns the number of bytes read.
	fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize>;

	/// Fetches the DFU functional descriptor via a standard GET_DESCRIPTOR
	/// on the interface.
	fn functional_descriptor(&mut self) -> Result<DfuFunctionalDescriptor>;
}

/// The real [`DfuLink`] over a rusb device handle.
pub struct UsbDfuLink
{
	handle: rusb::DeviceHandle<rusb::GlobalContext>,
	interface: u8,
}

impl UsbDfuLink
{
	/// Opens the first device on the bus that matches the DFU-mode identity
	/// and claims its DFU interface.
	pub fn open() -> Result<Self>
	{
		let (vid, pid) = DFU_VID_PID;
		let mut handle = rusb::open_device_with_vid_pid(vid.0, pid.0).ok_or(Error::DeviceNotFound)?;
		handle.claim_interface(0)?;
		debug!("opened DFU device {:04x}:{:04x}", vid.0, pid.0);

		Ok(Self {
			handle,
			interface: 0,
		})
	}
}

impl DfuLink for UsbDfuLink
{
	fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()>
	{
		let request_type = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
		self.handle.write_control(
			request_type,
			request as u8,
			value,
			u16::from(self.interface),
			data,
			USB_TIMEOUT,
		)?;
		Ok(())
	}

	fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8]) -> Result<usize>
	{
		let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
		Ok(self.handle.read_control(
			request_type,
			request as u8,
			value,
			u16::from(self.interface),
			buf,
			USB_TIMEOUT,
		)?)
	}

	fn functional_descriptor(&mut self) -> Result<DfuFunctionalDescriptor>
	{
		const GET_DESCRIPTOR: u8 = 0x06;

		let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface);
		let mut buf = [0u8; DfuFunctionalDescriptor::LENGTH as usize];
		let read = self.handle.read_control(
			request_type,
			GET_DESCRIPTOR,
			u16::from(DfuFunctionalDescriptor::TYPE) << 8,
			u16::from(self.interface),
			&mut buf,
			USB_TIMEOUT,
		)?;
		if read != buf.len() {
			return Err(ProtocolError::Truncated {
				expected: buf.len(),
				actual: read,
			}
			.into());
		}
		Ok(DfuFunctionalDescriptor::from_bytes(&buf)?)
	}
}

/// Drives the DfuSe download state machine over a [`DfuLink`].
pub struct DfuProgrammer<L: DfuLink>
{
	link: L,
	transfer_size: usize,
}

impl DfuProgrammer<UsbDfuLink>
{
	/// A programmer over the first DFU-mode device on the bus.
	pub fn open() -> Result<Self>
	{
		Self::new(UsbDfuLink::open()?)
	}
}

impl<L: DfuLink> DfuProgrammer<L>
{
	pub fn new(mut link: L) -> Result<Self>
	{
		let descriptor = link.functional_descriptor()?;
		let transfer_size =
			(descriptor.wTransferSize as usize).clamp(TRANSFER_SIZE_RANGE.0, TRANSFER_SIZE_RANGE.1);
		debug!("DFU transfer size {transfer_size} (device reported {})", descriptor.wTransferSize);

		Ok(Self {
			link,
			transfer_size,
		})
	}

	/// Programs a firmware image.
	///
	/// An ELF32 image is split into its loadable segments; anything else is
	/// written as a flat binary at [`DEFAULT_LOAD_ADDRESS`]. `progress` is
	/// called with the byte count of each block as the device accepts it.
	pub fn program<P>(&mut self, firmware: &[u8], mut progress: P) -> Result<()>
	where
		P: FnMut(usize),
	{
		let segments = match elf::load_segments(firmware)? {
			Some(segments) => {
				info!("programming {} ELF segment(s)", segments.len());
				segments
			},
			None => {
				info!("programming {} bytes as flat binary", firmware.len());
				vec![Segment {
					address: DEFAULT_LOAD_ADDRESS,
					data: firmware.to_vec(),
				}]
			},
		};

		for segment in &segments {
			self.download_segment(segment, &mut progress)?;
		}

		// Zero-length DNLOAD triggers manifestation of the whole image.
		self.link.control_out(DfuRequest::Dnload, 0, &[])?;
		self.poll_until_ready()?;
		info!("firmware download complete, device manifesting");

		Ok(())
	}

	fn download_segment<P>(&mut self, segment: &Segment, progress: &mut P) -> Result<()>
	where
		P: FnMut(usize),
	{
		debug!("segment: {} bytes at {:#010x}", segment.data.len(), segment.address);

		self.clear_status_if_error()?;
		self.set_address_pointer(segment.address)?;

		// Block numbering restarts per segment: 0 is the command channel,
		// 1 is reserved, data begins at 2.
		let mut block = FIRST_DATA_BLOCK;
		for chunk in segment.data.chunks(self.transfer_size) {
			trace!("block {block}: {} bytes", chunk.len());
			self.link.control_out(DfuRequest::Dnload, block, chunk)?;
			self.poll_until_ready()?;
			progress(chunk.len());
			block += 1;
		}

		Ok(())
	}

	/// A device stuck in dfuERROR refuses everything; clear it first.
	fn clear_status_if_error(&mut self) -> Result<()>
	{
		let report = self.get_status()?;
		if report.state == DfuState::dfuERROR {
			debug!("device in dfuERROR ({:?}), clearing", report.status);
			self.link.control_out(DfuRequest::ClrStatus, 0, &[])?;
		}
		Ok(())
	}

	/// DfuSe SET_ADDRESS_POINTER: DNLOAD on block 0 with the command byte
	/// and the little-endian target address.
	fn set_address_pointer(&mut self, address: u32) -> Result<()>
	{
		let mut payload = [0u8; 5];
		payload[0] = SET_ADDRESS_POINTER;
		payload[1..].copy_from_slice(&address.to_le_bytes());

		self.link.control_out(DfuRequest::Dnload, 0, &payload)?;
		self.poll_until_ready()
	}

	fn get_status(&mut self) -> Result<StatusReport>
	{
		let mut buf = [0u8; 6];
		let read = self.link.control_in(DfuRequest::GetStatus, 0, &mut buf)?;
		if read != buf.len() {
			return Err(ProtocolError::Truncated {
				expected: buf.len(),
				actual: read,
			}
			.into());
		}
		Ok(StatusReport::from_bytes(&buf)?)
	}

	/// Polls GETSTATUS until the device settles in a state that accepts the
	/// next request, honoring the poll interval it asks for.
	fn poll_until_ready(&mut self) -> Result<()>
	{
		use DfuState::*;

		loop {
			let report = self.get_status()?;
			if report.status != DfuStatus::OK {
				return Err(Error::Dfu {
					status: report.status,
					state: report.state,
				});
			}

			match report.state {
				dfuDNBUSY | dfuMANIFEST => {
					let wait = Duration::from_millis(u64::from(report.poll_timeout)).min(POLL_TIMEOUT_CAP);
					trace!("device busy in {:?}, waiting {wait:?}", report.state);
					std::thread::sleep(wait);
				},
				dfuDNLOAD_IDLE | dfuIDLE | dfuMANIFEST_SYNC | dfuMANIFEST_WAIT_RESET => return Ok(()),
				other => {
					// Transitional state; give the device a moment.
					let wait = Duration::from_millis(u64::from(report.poll_timeout).clamp(1, 100));
					trace!("device in {other:?}, waiting {wait:?}");
					std::thread::sleep(wait);
				},
			}
		}
	}
}
