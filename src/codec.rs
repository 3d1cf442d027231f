// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Conversion between packed wire buffers and typed records.
//!
//! Every record the firmware speaks has a fixed little-endian layout with no
//! padding; the host always knows how many bytes to expect for a given
//! opcode. Implementations must keep `encode`/`decode` exact inverses so a
//! record round-trips byte-for-byte.

use crate::error::ProtocolError;

/// A fixed-layout record exchanged with the firmware.
pub trait WireRecord: Sized
{
	/// Exact on-the-wire size of this record in bytes.
	const SIZE: usize;

	/// Packs the record into its wire form. The returned buffer is always
	/// exactly [`Self::SIZE`] bytes long.
	fn encode(&self) -> Vec<u8>;

	/// Unpacks a record from its wire form. `bytes` must be exactly
	/// [`Self::SIZE`] bytes long.
	fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

/// Guards a decode against short or oversized buffers.
pub(crate) fn expect_len(bytes: &[u8], expected: usize) -> Result<(), ProtocolError>
{
	if bytes.len() != expected {
		return Err(ProtocolError::Truncated {
			expected,
			actual: bytes.len(),
		});
	}
	Ok(())
}
