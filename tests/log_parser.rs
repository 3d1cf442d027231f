// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Log decoding against synthetic flash dumps.

use chrono::{Duration, TimeZone, Utc};
use wvutil::codec::WireRecord;
use wvutil::log_parser::{PAGE_SIZE, parse_log};
use wvutil::protocol::{LogEntry, LogPin, LogTag};

fn tick_entry(tick: u32, sense: u8) -> Vec<u8>
{
	LogEntry {
		header: (tick << 2) | LogTag::McuTick as u32,
		ts: [25, 40, 0, 0],
		pins: [LogPin {
			volts_dv: 120,
			amps_da: 5,
		}; 6],
		hpwr_sense: sense,
	}
	.encode()
}

fn system_time_entry(minutes: u32) -> Vec<u8>
{
	LogEntry {
		header: (minutes << 2) | LogTag::SystemTime as u32,
		ts: [0; 4],
		pins: [LogPin::default(); 6],
		hpwr_sense: 0,
	}
	.encode()
}

fn power_on_entry() -> Vec<u8>
{
	LogEntry {
		header: LogTag::PowerOn as u32,
		ts: [0; 4],
		pins: [LogPin::default(); 6],
		hpwr_sense: 0,
	}
	.encode()
}

fn parse_base() -> chrono::DateTime<Utc>
{
	Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

#[test]
fn single_entry_with_sentinel_run()
{
	// One tick entry (250 ticks = 1000 ms past the base), then erased flash.
	let mut dump = tick_entry(250, 1);
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].timestamp, parse_base() + Duration::milliseconds(1000));
	assert_eq!(records[0].entry.hpwr_sense, 1);
}

#[test]
fn sentinel_run_terminates_parsing()
{
	// A valid prefix, 32 EMPTY bytes, then another entry that must never be
	// reached because the sentinel ended the parse.
	let mut dump = Vec::new();
	dump.extend(tick_entry(100, 0));
	dump.extend(tick_entry(200, 0));
	dump.extend(std::iter::repeat_n(0xffu8, 32));
	dump.extend(tick_entry(300, 0));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 2);
}

#[test]
fn leading_erased_flash_is_not_a_sentinel()
{
	// Before the first valid entry, EMPTY bytes do not count toward the
	// end-of-log run.
	let mut dump = vec![0xffu8; 64];
	dump.extend(tick_entry(50, 0));
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 1);
}

#[test]
fn timestamps_are_monotonic_and_power_on_advances_a_day()
{
	let mut dump = Vec::new();
	dump.extend(tick_entry(250, 0)); // base + 1.0 s
	dump.extend(tick_entry(500, 0)); // base + 2.0 s
	dump.extend(tick_entry(100, 0)); // regression: power-on, +1 day
	dump.extend(tick_entry(350, 0)); // +1.0 s within the new epoch
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 4);

	for pair in records.windows(2) {
		assert!(pair[1].timestamp >= pair[0].timestamp);
	}

	assert_eq!(records[0].timestamp, parse_base() + Duration::milliseconds(1000));
	assert_eq!(records[1].timestamp, parse_base() + Duration::milliseconds(2000));
	assert_eq!(records[2].timestamp, records[1].timestamp + Duration::days(1));
	assert_eq!(records[3].timestamp, records[2].timestamp + Duration::milliseconds(1000));
}

#[test]
fn power_on_record_occupies_a_full_slot()
{
	// A genuine POWER_ON record mid-stream: it emits nothing, shifts the
	// clock by a day, and the parser must step over its whole 21-byte slot
	// so the entries behind it stay aligned.
	let mut dump = Vec::new();
	dump.extend(tick_entry(250, 0)); // base + 1.0 s
	dump.extend(power_on_entry()); // +1 day, no record
	dump.extend(tick_entry(500, 1)); // +1.0 s on the running counter
	dump.extend(tick_entry(750, 2)); // +1.0 s again
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 3);
	assert_eq!(records[0].timestamp, parse_base() + Duration::milliseconds(1000));
	assert_eq!(
		records[1].timestamp,
		records[0].timestamp + Duration::days(1) + Duration::milliseconds(1000)
	);
	assert_eq!(records[2].timestamp, records[1].timestamp + Duration::milliseconds(1000));
	// Alignment survived: the payloads behind the power-on mark decode
	// intact rather than as reinterpreted padding.
	assert_eq!(records[1].entry.hpwr_sense, 1);
	assert_eq!(records[2].entry.hpwr_sense, 2);
}

#[test]
fn zero_tick_entries_are_skipped()
{
	let mut dump = Vec::new();
	dump.extend(vec![0u8; LogEntry::SIZE]); // tag MCU_TICK, tick 0
	dump.extend(tick_entry(250, 2));
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].entry.hpwr_sense, 2);
}

#[test]
fn corrupt_hpwr_sense_is_skipped()
{
	let mut dump = Vec::new();
	dump.extend(tick_entry(250, 4)); // out of range, dropped
	dump.extend(tick_entry(500, 3));
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].entry.hpwr_sense, 3);
}

#[test]
fn entries_never_straddle_a_page_boundary()
{
	// Twelve entries fill offsets 0..252 of the first page. The firmware
	// cannot fit a thirteenth before offset 256, so the parser must skip the
	// page tail -- even though its bytes here decode as a POWER_ON tag that
	// would shift the clock by a day if it were (incorrectly) read.
	let mut dump = Vec::new();
	for index in 0..12u32 {
		dump.extend(tick_entry(250 * (index + 1), 0));
	}
	assert_eq!(dump.len(), 252);
	dump.extend([0xaa, 0xaa, 0xaa, 0xaa]); // page tail garbage, tag bits = 2
	assert_eq!(dump.len(), PAGE_SIZE);
	dump.extend(tick_entry(250 * 13, 0));
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 13);
	// No day jump: the tail garbage was skipped, not interpreted.
	assert_eq!(
		records[12].timestamp - records[11].timestamp,
		Duration::milliseconds(250 * 4)
	);
}

#[test]
fn system_time_entry_rebases_the_clock()
{
	// 2026-03-14 00:00 UTC in minutes since the Unix epoch.
	let wall = Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap();
	let minutes = (wall.timestamp() / 60) as u32;

	let mut dump = Vec::new();
	dump.extend(tick_entry(250, 0));
	dump.extend(system_time_entry(minutes));
	dump.extend(tick_entry(500, 0)); // 250 ticks after the rebase point
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	assert_eq!(records.len(), 2);
	assert_eq!(records[0].timestamp, parse_base() + Duration::milliseconds(1000));
	assert_eq!(records[1].timestamp, wall + Duration::milliseconds(1000));
}

#[test]
fn log_records_surface_as_device_data()
{
	let mut dump = tick_entry(250, 1);
	dump.extend(std::iter::repeat_n(0xffu8, 52));

	let records = parse_log(&dump);
	let data = records[0].to_device_data();

	assert!(!data.connected);
	assert_eq!(data.temps_c[0], 25.0);
	assert_eq!(data.temps_c[1], 40.0);
	assert_eq!(data.pin_voltage_v[0], 12.0);
	assert_eq!(data.pin_current_a[0], 0.5);
	assert_eq!(data.psu_capability_w, 300); // sense 1 on the 12VHPWR ladder
	assert_eq!(data.timestamp, Some(records[0].timestamp));
}
