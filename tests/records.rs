// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Round-trip guarantees for the packed wire records.

use wvutil::codec::WireRecord;
use wvutil::protocol::{BuildInfo, DeviceConfig, LogEntry, LogPin, PinReading, SensorReadings, VendorData};

/// decode(encode(v)) == v and the encoded length is the static record size.
fn assert_value_round_trip<T>(value: T)
where
	T: WireRecord + PartialEq + std::fmt::Debug,
{
	let encoded = value.encode();
	assert_eq!(encoded.len(), T::SIZE);
	assert_eq!(T::decode(&encoded).unwrap(), value);
}

/// encode(decode(b)) == b for any correctly sized buffer.
fn assert_buffer_round_trip<T>(bytes: &[u8])
where
	T: WireRecord,
{
	assert_eq!(bytes.len(), T::SIZE);
	assert_eq!(T::decode(bytes).unwrap().encode(), bytes);
}

fn patterned(len: usize) -> Vec<u8>
{
	(0..len).map(|i| (i as u8).wrapping_mul(37).wrapping_add(11)).collect()
}

#[test]
fn vendor_data_round_trips()
{
	assert_value_round_trip(VendorData {
		vendor_id: 0xef,
		product_id: 0x05,
		firmware_version: 0x0103,
	});
	assert_buffer_round_trip::<VendorData>(&patterned(VendorData::SIZE));
}

#[test]
fn sensor_readings_round_trip()
{
	let mut pins = [PinReading::default(); 6];
	pins[0] = PinReading {
		voltage_mv: 12_000,
		current_ma: 500,
	};
	pins[5] = PinReading {
		voltage_mv: 3_300,
		current_ma: 65_535,
	};

	assert_value_round_trip(SensorReadings {
		ts: [235, 410, -52, 0],
		pins,
		hpwr_capability: 3,
		fault_status: 0x8001,
		fault_log: 0x00ff,
	});
	assert_buffer_round_trip::<SensorReadings>(&patterned(SensorReadings::SIZE));
}

#[test]
fn log_entry_round_trips()
{
	let mut pins = [LogPin::default(); 6];
	pins[2] = LogPin {
		volts_dv: 120,
		amps_da: 8,
	};

	assert_value_round_trip(LogEntry {
		header: (123_456 << 2) | 0,
		ts: [25, 40, 0, 255],
		pins,
		hpwr_sense: 2,
	});
	assert_buffer_round_trip::<LogEntry>(&patterned(LogEntry::SIZE));
}

#[test]
fn opaque_records_round_trip()
{
	let config_bytes = patterned(DeviceConfig::SIZE);
	assert_buffer_round_trip::<DeviceConfig>(&config_bytes);
	assert_value_round_trip(DeviceConfig::decode(&config_bytes).unwrap());

	let build_bytes = patterned(BuildInfo::SIZE);
	assert_buffer_round_trip::<BuildInfo>(&build_bytes);
}

#[test]
fn decode_rejects_wrong_length()
{
	assert!(VendorData::decode(&[0xef, 0x05]).is_err());
	assert!(SensorReadings::decode(&patterned(SensorReadings::SIZE + 1)).is_err());
	assert!(LogEntry::decode(&patterned(LogEntry::SIZE - 1)).is_err());
}
