// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Extraction of loadable segments from ELF32 firmware images.

use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use log::debug;

use crate::error::{Error, Result};

/// One contiguous run of firmware bytes and the flash address it loads at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment
{
	pub address: u32,
	pub data: Vec<u8>,
}

/// Minimum program header entry size of a well-formed ELF32 image.
const MIN_PHENTSIZE: u16 = 32;

/// Pulls the loadable segments out of a firmware image.
///
/// Returns `Ok(None)` when the payload does not start with the ELF magic —
/// the caller then treats it as a flat binary. A payload that *claims* to be
/// an ELF but is not a usable 32-bit little-endian image fails hard; silently
/// flashing it as raw bytes would brick the device.
pub fn load_segments(image: &[u8]) -> Result<Option<Vec<Segment>>>
{
	if image.len() < 4 || image[..4] != [0x7f, b'E', b'L', b'F'] {
		return Ok(None);
	}

	let elf = Elf::parse(image).map_err(|e| Error::ImageFormat(e.to_string()))?;

	if elf.is_64 {
		return Err(Error::ImageFormat("64-bit ELF cannot target this device".into()));
	}
	if !elf.little_endian {
		return Err(Error::ImageFormat("big-endian ELF cannot target this device".into()));
	}
	if elf.header.e_phentsize < MIN_PHENTSIZE {
		return Err(Error::ImageFormat(format!(
			"program header entries are {} bytes, expected at least {MIN_PHENTSIZE}",
			elf.header.e_phentsize
		)));
	}

	let mut segments = Vec::new();
	for header in &elf.program_headers {
		if header.p_type != PT_LOAD || header.p_filesz == 0 {
			continue;
		}

		// The physical address is the flash location; the virtual address is
		// only a fallback for images that never set p_paddr.
		let address = if header.p_paddr != 0 {
			header.p_paddr
		} else {
			header.p_vaddr
		} as u32;

		let start = header.p_offset as usize;
		let end = start + header.p_filesz as usize;
		let data = image
			.get(start..end)
			.ok_or_else(|| {
				Error::ImageFormat(format!(
					"segment at {address:#010x} extends past end of file (offset {start}..{end})"
				))
			})?
			.to_vec();

		debug!("load segment: {} bytes at {address:#010x}", data.len());
		segments.push(Segment {
			address,
			data,
		});
	}

	if segments.is_empty() {
		return Err(Error::ImageFormat("image has no loadable segments".into()));
	}

	segments.sort_by_key(|segment| segment.address);
	Ok(Some(segments))
}

#[cfg(test)]
mod tests
{
	use super::*;

	/// Builds a minimal ELF32 little-endian image with the given
	/// (address, payload) segments.
	fn build_elf32(segments: &[(u32, &[u8])]) -> Vec<u8>
	{
		const EHSIZE: usize = 52;
		const PHENTSIZE: usize = 32;

		let phoff = EHSIZE;
		let data_start = phoff + segments.len() * PHENTSIZE;

		let mut image = Vec::new();
		// e_ident
		image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
		image.extend_from_slice(&[0u8; 8]);
		image.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
		image.extend_from_slice(&40u16.to_le_bytes()); // e_machine = EM_ARM
		image.extend_from_slice(&1u32.to_le_bytes()); // e_version
		image.extend_from_slice(&0u32.to_le_bytes()); // e_entry
		image.extend_from_slice(&(phoff as u32).to_le_bytes()); // e_phoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
		image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
		image.extend_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
		image.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes()); // e_phentsize
		image.extend_from_slice(&(segments.len() as u16).to_le_bytes()); // e_phnum
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
		image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
		assert_eq!(image.len(), EHSIZE);

		let mut offset = data_start;
		for (address, payload) in segments {
			image.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
			image.extend_from_slice(&(offset as u32).to_le_bytes()); // p_offset
			image.extend_from_slice(&address.to_le_bytes()); // p_vaddr
			image.extend_from_slice(&address.to_le_bytes()); // p_paddr
			image.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // p_filesz
			image.extend_from_slice(&(payload.len() as u32).to_le_bytes()); // p_memsz
			image.extend_from_slice(&5u32.to_le_bytes()); // p_flags = R+X
			image.extend_from_slice(&4u32.to_le_bytes()); // p_align
			offset += payload.len();
		}

		for (_, payload) in segments {
			image.extend_from_slice(payload);
		}
		image
	}

	#[test]
	fn flat_binary_is_not_an_elf()
	{
		assert_eq!(load_segments(&[0xff; 64]).unwrap(), None);
		assert_eq!(load_segments(&[]).unwrap(), None);
	}

	#[test]
	fn extracts_sorted_load_segments()
	{
		let image = build_elf32(&[(0x0800_2000, b"second"), (0x0800_0000, b"first")]);
		let segments = load_segments(&image).unwrap().unwrap();

		assert_eq!(segments.len(), 2);
		assert_eq!(segments[0].address, 0x0800_0000);
		assert_eq!(segments[0].data, b"first");
		assert_eq!(segments[1].address, 0x0800_2000);
		assert_eq!(segments[1].data, b"second");
	}

	#[test]
	fn rejects_truncated_segment()
	{
		let mut image = build_elf32(&[(0x0800_0000, b"some payload here")]);
		image.truncate(image.len() - 4);
		assert!(matches!(load_segments(&image), Err(Error::ImageFormat(_))));
	}

	#[test]
	fn rejects_elf64()
	{
		let mut image = build_elf32(&[(0x0800_0000, b"payload")]);
		image[4] = 2; // EI_CLASS = ELFCLASS64
		assert!(load_segments(&image).is_err());
	}
}
