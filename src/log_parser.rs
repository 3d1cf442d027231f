// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Decoder for the device's on-board flash log.
//!
//! The log region is a flat byte dump, paged at 256 bytes. Entries are
//! 21-byte [`LogEntry`] records tagged in the low two bits of their header
//! word; the remaining 30 bits carry a 4 ms MCU tick. Erased flash reads as
//! 0xFF, which conveniently decodes as the EMPTY tag, so a long run of EMPTY
//! marks end-of-data.
//!
//! Timestamps are reconstructed from tick deltas on top of a fixed base so a
//! given dump always parses to the same instants. A SYSTEM_TIME entry, when
//! the firmware writes one, rebases the clock to wall time; a power-on (or a
//! tick counter that jumps backwards, which means the same thing) advances
//! the base by one day to keep epochs visually separated.

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, trace, warn};

use crate::codec::WireRecord;
use crate::protocol::{LogEntry, LogTag, sense_watts};
use crate::session::DeviceData;

/// Flash page size; an entry never straddles a page boundary.
pub const PAGE_SIZE: usize = 256;

/// Milliseconds per MCU tick.
const TICK_MS: i64 = 4;

/// Consecutive EMPTY tags that terminate parsing.
const EMPTY_RUN_LIMIT: u32 = 32;

/// Fixed parse base, so dumps decode deterministically when the log carries
/// no SYSTEM_TIME entry.
fn parse_epoch() -> DateTime<Utc>
{
	Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("Unreachable: epoch is a valid instant")
}

/// One decoded log record with its reconstructed UTC timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedEntry
{
	pub timestamp: DateTime<Utc>,
	pub entry: LogEntry,
}

impl TimestampedEntry
{
	/// Surfaces this record through the same consumer type as live samples.
	/// Identity fields are empty: the log does not carry them.
	pub fn to_device_data(&self) -> DeviceData
	{
		let mut temps_c = [0f32; 4];
		for (out, raw) in temps_c.iter_mut().zip(self.entry.ts) {
			*out = f32::from(raw);
		}

		let mut pin_voltage_v = [0f32; 6];
		let mut pin_current_a = [0f32; 6];
		for (index, pin) in self.entry.pins.iter().enumerate() {
			pin_voltage_v[index] = f32::from(pin.volts_dv) / 10.0;
			pin_current_a[index] = f32::from(pin.amps_da) / 10.0;
		}

		DeviceData {
			connected: false,
			hardware_revision: String::new(),
			firmware_version: 0,
			temps_c,
			pin_voltage_v,
			pin_current_a,
			psu_capability_w: sense_watts(self.entry.hpwr_sense),
			fault_status: 0,
			fault_log: 0,
			timestamp: Some(self.timestamp),
		}
	}
}

/// Decodes a log dump into timestamped records.
///
/// Corrupt entries (HpwrSense out of range) are skipped; a run of
/// [`EMPTY_RUN_LIMIT`] EMPTY tags after the first valid entry ends parsing.
pub fn parse_log(bytes: &[u8]) -> Vec<TimestampedEntry>
{
	let mut records: Vec<TimestampedEntry> = Vec::new();
	let mut base = parse_epoch();
	let mut last_tick: u32 = 0;
	let mut empty_run: u32 = 0;
	let mut offset = 0usize;

	while offset + LogEntry::SIZE <= bytes.len() {
		// Entries never straddle a flash page; once real data has been seen,
		// a slot that would cross the boundary means the firmware moved on
		// to the next page.
		if !records.is_empty() && offset % PAGE_SIZE > PAGE_SIZE - LogEntry::SIZE {
			offset = (offset / PAGE_SIZE + 1) * PAGE_SIZE;
			continue;
		}

		let header = u32::from_le_bytes(
			bytes[offset..offset + 4].try_into().expect("Unreachable: bounds checked above"),
		);
		let tag = match (header & 0b11) as u8 {
			0 => LogTag::McuTick,
			1 => LogTag::SystemTime,
			2 => LogTag::PowerOn,
			3 => LogTag::Empty,
			_ => unreachable!(),
		};
		let ts30 = header >> 2;

		match tag {
			LogTag::Empty => {
				offset += 1;
				if !records.is_empty() {
					empty_run += 1;
					if empty_run >= EMPTY_RUN_LIMIT {
						trace!("end-of-log sentinel at offset {offset}");
						break;
					}
				}
			},
			LogTag::SystemTime => {
				if ts30 == 0 {
					// Reserved slot from firmware that never filled it in.
					offset += 1;
				} else {
					// Wall clock as minutes since the Unix epoch; rebases
					// everything that follows. The tick counter itself is
					// unaffected.
					base = Utc
						.timestamp_opt(i64::from(ts30) * 60, 0)
						.single()
						.unwrap_or_else(parse_epoch);
					debug!("log rebased to {base} by SYSTEM_TIME entry");
					offset += LogEntry::SIZE;
				}
			},
			LogTag::PowerOn => {
				// A power-on mark is written as a full slot like every other
				// record; only its header carries information.
				base += Duration::days(1);
				offset += LogEntry::SIZE;
			},
			LogTag::McuTick => {
				if ts30 == 0 {
					// Never a valid tick; half-written slot.
					offset += LogEntry::SIZE;
					continue;
				}

				if ts30 < last_tick {
					// The counter restarted: the device powered on between
					// these two entries.
					base += Duration::days(1);
				} else {
					base += Duration::milliseconds(i64::from(ts30 - last_tick) * TICK_MS);
				}
				last_tick = ts30;

				let entry = match LogEntry::decode(&bytes[offset..offset + LogEntry::SIZE]) {
					Ok(entry) => entry,
					Err(e) => {
						warn!("undecodable log entry at offset {offset}: {e}");
						offset += LogEntry::SIZE;
						continue;
					},
				};
				if entry.hpwr_sense > LogEntry::HPWR_SENSE_MAX {
					warn!(
						"corrupt log entry at offset {offset}: HpwrSense {}",
						entry.hpwr_sense
					);
					offset += LogEntry::SIZE;
					continue;
				}

				records.push(TimestampedEntry {
					timestamp: base,
					entry,
				});
				empty_run = 0;
				offset += LogEntry::SIZE;
			},
		}
	}

	debug!("parsed {} log record(s) from {} bytes", records.len(), bytes.len());
	records
}
