// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! The live command/response session with one WireView Pro II.
//!
//! A [`DeviceSession`] owns a [`SharedPort`], performs the welcome/vendor
//! handshake, serializes commands, and runs a background polling thread that
//! publishes decoded telemetry. Every command is one transaction on the
//! shared port, so its (write, read) pair can never interleave with another
//! thread's or another process's traffic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};

use crate::codec::WireRecord;
use crate::error::{Error, Result};
use crate::events::{EventBus, Subscription};
use crate::port::{LinkFactory, PortTransaction, SharedPort};
use crate::protocol::{
	BuildInfo, Command, DeviceConfig, NVM_MAGIC, NvmCommand, ScreenCommand, SensorReadings, UID_LEN, VendorData,
	WELCOME_BANNER, WELCOME_LEN, capability_watts, format_uid,
};

/// Bounds for the polling cadence, milliseconds.
const POLL_INTERVAL_RANGE: (u64, u64) = (100, 5000);
/// Default polling cadence, milliseconds.
const POLL_INTERVAL_DEFAULT: u64 = 1000;
/// How long `disconnect` waits for the polling thread to finish its current
/// transaction before abandoning it.
const POLL_EXIT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Granularity of cancellable sleeps inside the polling thread.
const POLL_SLEEP_SLICE: Duration = Duration::from_millis(25);
/// Settling time between the bootloader command and tearing the session down.
const BOOTLOADER_SETTLE: Duration = Duration::from_millis(50);
/// Payload bytes carried per WriteConfig frame (a 64-byte frame minus the
/// opcode and offset bytes).
const CONFIG_FRAME_PAYLOAD: usize = 62;

/// Identity of the connected device, populated by the handshake and cleared
/// on disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity
{
	/// Vendor/product byte pair rendered as hex, e.g. `"EF05"`.
	pub hardware_revision: String,
	pub firmware_version: u16,
	/// The 12-byte unique id rendered as uppercase hex.
	pub unique_id: String,
}

/// One consumer-facing telemetry update, either a live sample or a record
/// parsed from the on-board log (in which case `timestamp` is set).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceData
{
	pub connected: bool,
	pub hardware_revision: String,
	pub firmware_version: u16,
	/// Temperature channels in degrees Celsius.
	pub temps_c: [f32; 4],
	/// Pin voltages in volts.
	pub pin_voltage_v: [f32; 6],
	/// Pin currents in amps.
	pub pin_current_a: [f32; 6],
	/// Attached PSU capability in watts; 0 when not detected.
	pub psu_capability_w: u32,
	pub fault_status: u16,
	pub fault_log: u16,
	/// UTC timestamp for log records; `None` for live samples.
	pub timestamp: Option<DateTime<Utc>>,
}

impl DeviceData
{
	/// Onboard inlet temperature, °C.
	pub fn temp_in_c(&self) -> f32
	{
		self.temps_c[0]
	}

	/// Onboard outlet temperature, °C.
	pub fn temp_out_c(&self) -> f32
	{
		self.temps_c[1]
	}

	/// Maps one decoded sensor snapshot into consumer units.
	pub fn from_sensor(identity: &DeviceIdentity, readings: &SensorReadings) -> Self
	{
		let mut temps_c = [0f32; 4];
		for (out, raw) in temps_c.iter_mut().zip(readings.ts) {
			*out = f32::from(raw) / 10.0;
		}

		let mut pin_voltage_v = [0f32; 6];
		let mut pin_current_a = [0f32; 6];
		for (index, pin) in readings.pins.iter().enumerate() {
			pin_voltage_v[index] = f32::from(pin.voltage_mv) / 1000.0;
			pin_current_a[index] = f32::from(pin.current_ma) / 1000.0;
		}

		Self {
			connected: true,
			hardware_revision: identity.hardware_revision.clone(),
			firmware_version: identity.firmware_version,
			temps_c,
			pin_voltage_v,
			pin_current_a,
			psu_capability_w: capability_watts(readings.hpwr_capability),
			fault_status: readings.fault_status,
			fault_log: readings.fault_log,
			timestamp: None,
		}
	}
}

/// State shared between the session handle and its polling thread.
struct SessionShared
{
	port: SharedPort,
	connected: AtomicBool,
	identity: Mutex<Option<DeviceIdentity>>,
	poll_interval_ms: AtomicU64,
	poll_cancel: AtomicBool,
	connection_events: EventBus<bool>,
	data_events: EventBus<DeviceData>,
}

impl SessionShared
{
	/// One command/response exchange. `None` means the response deadline
	/// elapsed, which is not an error for an individual transaction.
	fn transact(&self, command: &[u8], response_len: usize) -> Result<Option<Vec<u8>>>
	{
		let mut txn = self.port.transaction()?;
		txn.discard_input()?;
		txn.write_all(command)?;
		if response_len == 0 {
			return Ok(Some(Vec::new()));
		}
		txn.read_exact_deadline(response_len)
	}

	/// Tears the connection down if it is up. Safe to call from any thread,
	/// including the polling thread itself; events fire after the port locks
	/// are released.
	fn teardown(&self)
	{
		if !self.connected.swap(false, Ordering::SeqCst) {
			return;
		}

		self.identity.lock().expect("identity poisoned").take();
		if let Err(e) = self.port.close() {
			warn!("error closing port during disconnect: {e}");
		}
		info!("device disconnected");
		self.connection_events.emit(false);
	}

	fn poll_loop(self: &Arc<Self>)
	{
		debug!("polling thread started");
		loop {
			if self.poll_cancel.load(Ordering::SeqCst) {
				break;
			}

			match self.poll_once() {
				Ok(Some(data)) => self.data_events.emit(data),
				// Timed out this tick; the device may be busy redrawing.
				Ok(None) => trace!("sensor poll yielded no data this tick"),
				Err(e) => {
					warn!("sensor poll failed, disconnecting: {e}");
					self.teardown();
					break;
				},
			}

			// Sleep in slices so cancellation from disconnect() is observed
			// promptly between transactions.
			let interval = Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed));
			let start = Instant::now();
			while start.elapsed() < interval {
				if self.poll_cancel.load(Ordering::SeqCst) {
					debug!("polling thread cancelled");
					return;
				}
				std::thread::sleep(POLL_SLEEP_SLICE.min(interval));
			}
		}
		debug!("polling thread exiting");
	}

	fn poll_once(&self) -> Result<Option<DeviceData>>
	{
		if !self.connected.load(Ordering::SeqCst) {
			return Ok(None);
		}

		let response = self.transact(&[Command::ReadSensorValues.into()], SensorReadings::SIZE)?;
		let Some(bytes) = response else {
			return Ok(None);
		};
		let readings = SensorReadings::decode(&bytes)?;

		let identity = self.identity.lock().expect("identity poisoned");
		let Some(identity) = identity.as_ref() else {
			// Raced with a disconnect; drop the sample.
			return Ok(None);
		};
		Ok(Some(DeviceData::from_sensor(identity, &readings)))
	}
}

/// A serialized command/response session with one WireView Pro II device.
pub struct DeviceSession
{
	shared: Arc<SessionShared>,
	poll_thread: Mutex<Option<JoinHandle<()>>>,
	/// Serializes connect/disconnect against each other. Never taken by the
	/// polling thread, which tears down directly on error.
	lifecycle: Mutex<()>,
}

impl DeviceSession
{
	/// A session over the named serial port. The port is not opened until
	/// [`connect`](Self::connect).
	pub fn new(port_name: &str) -> Result<Self>
	{
		Self::from_port(SharedPort::open(port_name)?)
	}

	/// A session over caller-provided serial links; the seam tests use to
	/// substitute a scripted device.
	pub fn with_factory(factory: LinkFactory) -> Result<Self>
	{
		Self::from_port(SharedPort::with_factory(factory)?)
	}

	fn from_port(port: SharedPort) -> Result<Self>
	{
		Ok(Self {
			shared: Arc::new(SessionShared {
				port,
				connected: AtomicBool::new(false),
				identity: Mutex::new(None),
				poll_interval_ms: AtomicU64::new(POLL_INTERVAL_DEFAULT),
				poll_cancel: AtomicBool::new(false),
				connection_events: EventBus::new("connection"),
				data_events: EventBus::new("data"),
			}),
			poll_thread: Mutex::new(None),
			lifecycle: Mutex::new(()),
		})
	}

	pub fn connected(&self) -> bool
	{
		self.shared.connected.load(Ordering::SeqCst)
	}

	/// Identity of the connected device; `None` while disconnected.
	pub fn identity(&self) -> Option<DeviceIdentity>
	{
		self.shared.identity.lock().expect("identity poisoned").clone()
	}

	/// Polling cadence in milliseconds.
	pub fn poll_interval_ms(&self) -> u64
	{
		self.shared.poll_interval_ms.load(Ordering::Relaxed)
	}

	/// Sets the polling cadence, clamped to 100..=5000 ms.
	pub fn set_poll_interval_ms(&self, interval: u64)
	{
		let clamped = interval.clamp(POLL_INTERVAL_RANGE.0, POLL_INTERVAL_RANGE.1);
		self.shared.poll_interval_ms.store(clamped, Ordering::Relaxed);
	}

	pub fn subscribe_connection(&self, handler: impl Fn(&bool) + Send + Sync + 'static) -> Subscription
	{
		self.shared.connection_events.subscribe(handler)
	}

	pub fn unsubscribe_connection(&self, subscription: Subscription)
	{
		self.shared.connection_events.unsubscribe(subscription)
	}

	pub fn subscribe_data(&self, handler: impl Fn(&DeviceData) + Send + Sync + 'static) -> Subscription
	{
		self.shared.data_events.subscribe(handler)
	}

	pub fn unsubscribe_data(&self, subscription: Subscription)
	{
		self.shared.data_events.unsubscribe(subscription)
	}

	/// Connects to the device: opens the port, validates the welcome banner
	/// and vendor identity, reads the unique id, resumes display updates and
	/// starts polling.
	///
	/// Returns `Ok(true)` once connected (idempotent) and `Ok(false)` when a
	/// healthy port is attached to something that is not a WireView Pro II —
	/// the wrong-device path is silent by design so a supervisor can walk a
	/// candidate list. `ConnectionChanged(true)` fires only on success.
	pub fn connect(&self) -> Result<bool>
	{
		let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
		if self.connected() {
			return Ok(true);
		}

		let identity = match self.handshake() {
			Ok(Some(identity)) => identity,
			Ok(None) => {
				// Wrong or mute device. Leave the port closed and stay quiet.
				let _ = self.shared.port.close();
				return Ok(false);
			},
			Err(e) => {
				let _ = self.shared.port.close();
				return Err(e);
			},
		};

		info!(
			"connected to WireView Pro II rev {} fw {} uid {}",
			identity.hardware_revision, identity.firmware_version, identity.unique_id
		);
		*self.shared.identity.lock().expect("identity poisoned") = Some(identity);
		self.shared.poll_cancel.store(false, Ordering::SeqCst);
		self.shared.connected.store(true, Ordering::SeqCst);

		let shared = Arc::clone(&self.shared);
		let handle = std::thread::Builder::new()
			.name("wv-poll".to_string())
			.spawn(move || shared.poll_loop())
			.expect("failed to spawn polling thread");
		*self.poll_thread.lock().expect("poll thread slot poisoned") = Some(handle);

		self.shared.connection_events.emit(true);
		Ok(true)
	}

	/// Runs the welcome and vendor exchange inside one transaction.
	/// `Ok(None)` means "not our device" (or one that never answered).
	fn handshake(&self) -> Result<Option<DeviceIdentity>>
	{
		let mut txn = self.shared.port.transaction()?;
		txn.discard_input()?;
		// The device emits its banner on RTS assertion.
		txn.set_rts(true)?;

		let Some(banner) = txn.read_exact_deadline(WELCOME_LEN)? else {
			debug!("no welcome banner within deadline");
			return Ok(None);
		};
		if &banner[..WELCOME_BANNER.len()] != WELCOME_BANNER.as_bytes() || banner[WELCOME_BANNER.len()] != 0 {
			debug!("welcome banner mismatch");
			return Ok(None);
		}

		let Some(vendor) = Self::command(&mut txn, Command::ReadVendorData, VendorData::SIZE)? else {
			debug!("no vendor data within deadline");
			return Ok(None);
		};
		let vendor = VendorData::decode(&vendor)?;
		if !vendor.is_wireview() {
			debug!(
				"vendor handshake mismatch: {:02x}/{:02x}",
				vendor.vendor_id, vendor.product_id
			);
			return Ok(None);
		}

		let Some(uid) = Self::command(&mut txn, Command::ReadUid, UID_LEN)? else {
			debug!("no unique id within deadline");
			return Ok(None);
		};
		let uid: [u8; UID_LEN] = uid.as_slice().try_into().expect("Unreachable: read_exact sized the buffer");

		// Defensive: a previous host may have died with the display paused.
		txn.write_all(&[Command::ScreenChange.into(), ScreenCommand::ResumeUpdates.into()])?;

		Ok(Some(DeviceIdentity {
			hardware_revision: vendor.hardware_revision(),
			firmware_version: vendor.firmware_version,
			unique_id: format_uid(&uid),
		}))
	}

	fn command(txn: &mut PortTransaction<'_>, command: Command, response_len: usize) -> Result<Option<Vec<u8>>>
	{
		txn.discard_input()?;
		txn.write_all(&[command.into()])?;
		txn.read_exact_deadline(response_len)
	}

	/// Disconnects: cancels polling, waits up to a second for the thread to
	/// finish its transaction, closes the port and emits
	/// `ConnectionChanged(false)`. Idempotent.
	pub fn disconnect(&self)
	{
		let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
		self.shared.poll_cancel.store(true, Ordering::SeqCst);

		if let Some(handle) = self.poll_thread.lock().expect("poll thread slot poisoned").take() {
			let deadline = Instant::now() + POLL_EXIT_TIMEOUT;
			while !handle.is_finished() && Instant::now() < deadline {
				std::thread::sleep(Duration::from_millis(10));
			}
			if handle.is_finished() {
				let _ = handle.join();
			} else {
				// Abandon the wait; the thread observes the cancel flag after
				// its current transaction and exits on its own.
				warn!("polling thread did not exit within {POLL_EXIT_TIMEOUT:?}, abandoning");
			}
		}

		self.shared.teardown();
	}

	/// Reads the firmware build string. `None` when disconnected or when the
	/// device does not answer in time.
	pub fn read_build_string(&self) -> Result<Option<String>>
	{
		if !self.connected() {
			return Ok(None);
		}

		let Some(bytes) = self.shared.transact(&[Command::ReadBuildInfo.into()], BuildInfo::SIZE)? else {
			return Ok(None);
		};
		Ok(Some(BuildInfo::decode(&bytes)?.as_str().to_string()))
	}

	/// Reads the device configuration blob. `None` when the device does not
	/// answer in time.
	pub fn read_config(&self) -> Result<Option<DeviceConfig>>
	{
		if !self.connected() {
			return Err(Error::NotConnected);
		}

		let Some(bytes) = self.shared.transact(&[Command::ReadConfig.into()], DeviceConfig::SIZE)? else {
			return Ok(None);
		};
		Ok(Some(DeviceConfig::decode(&bytes)?))
	}

	/// Writes the device configuration in frames of at most 64 bytes:
	/// opcode, payload offset, then up to 62 payload bytes per frame.
	pub fn write_config(&self, config: &DeviceConfig) -> Result<()>
	{
		if !self.connected() {
			return Err(Error::NotConnected);
		}

		let payload = config.encode();
		let mut txn = self.shared.port.transaction()?;
		for frame in config_frames(&payload) {
			txn.write_all(&frame)?;
		}
		Ok(())
	}

	/// Issues a non-volatile memory command. The magic guard bytes make an
	/// accidental invocation from line noise effectively impossible.
	pub fn nvm_cmd(&self, command: NvmCommand) -> Result<()>
	{
		if !self.connected() {
			return Err(Error::NotConnected);
		}

		let frame = [
			Command::NvmConfig.into(),
			NVM_MAGIC[0],
			NVM_MAGIC[1],
			NVM_MAGIC[2],
			NVM_MAGIC[3],
			command.into(),
		];
		self.shared.transact(&frame, 0).map(|_| ())
	}

	/// Issues a display command.
	pub fn screen_cmd(&self, command: ScreenCommand) -> Result<()>
	{
		if !self.connected() {
			return Err(Error::NotConnected);
		}

		self.shared
			.transact(&[Command::ScreenChange.into(), command.into()], 0)
			.map(|_| ())
	}

	/// Clears latched faults. Masks select which bits to clear; pass 0xFFFF
	/// for both to clear everything.
	pub fn clear_faults(&self, status_mask: u16, log_mask: u16) -> Result<()>
	{
		if !self.connected() {
			return Err(Error::NotConnected);
		}

		let mut frame = vec![Command::ClearFaults.into()];
		frame.extend_from_slice(&status_mask.to_le_bytes());
		frame.extend_from_slice(&log_mask.to_le_bytes());
		self.shared.transact(&frame, 0).map(|_| ())
	}

	/// Asks the device to reboot into its DFU bootloader, then tears the
	/// session down. Best-effort: the device drops off the bus mid-command,
	/// so errors are expected and swallowed.
	pub fn enter_bootloader(&self)
	{
		if let Err(e) = self.shared.transact(&[Command::Bootloader.into()], 0) {
			debug!("bootloader command error (expected during re-enumeration): {e}");
		}
		std::thread::sleep(BOOTLOADER_SETTLE);
		self.disconnect();
	}
}

impl Drop for DeviceSession
{
	fn drop(&mut self)
	{
		self.disconnect();
	}
}

/// Splits a configuration payload into write frames: opcode, payload offset,
/// then up to [`CONFIG_FRAME_PAYLOAD`] bytes. A payload that divides evenly
/// produces no trailing empty frame.
fn config_frames(payload: &[u8]) -> Vec<Vec<u8>>
{
	payload
		.chunks(CONFIG_FRAME_PAYLOAD)
		.enumerate()
		.map(|(index, chunk)| {
			let mut frame = Vec::with_capacity(2 + chunk.len());
			frame.push(Command::WriteConfig.into());
			frame.push((index * CONFIG_FRAME_PAYLOAD) as u8);
			frame.extend_from_slice(chunk);
			frame
		})
		.collect()
}
