// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Background supervision of device presence.
//!
//! [`AutoConnector`] rescans the candidate ports once a second while no
//! session is connected, connects to the first port that completes the
//! handshake, and republishes that session's events on its own unified
//! streams so consumers survive reconnect cycles without resubscribing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::enumerate::candidate_ports;
use crate::error::Result;
use crate::events::{EventBus, Subscription};
use crate::session::{DeviceData, DeviceSession};

/// Cadence of the presence scan.
const SCAN_INTERVAL: Duration = Duration::from_millis(1000);
/// Granularity of cancellable sleeps inside the supervisor.
const SCAN_SLEEP_SLICE: Duration = Duration::from_millis(25);
/// How long `stop` waits for the supervisor to wind down.
const STOP_TIMEOUT: Duration = Duration::from_millis(500);
/// Bounds for the forwarded polling cadence, milliseconds. The session
/// applies its own (tighter) lower bound on top.
const POLL_INTERVAL_RANGE: (u64, u64) = (50, 5000);

struct ConnectorShared
{
	cancel: AtomicBool,
	poll_interval_ms: AtomicU64,
	session: Mutex<Option<Arc<DeviceSession>>>,
	connection_events: Arc<EventBus<bool>>,
	data_events: Arc<EventBus<DeviceData>>,
}

impl ConnectorShared
{
	fn supervise(self: &Arc<Self>)
	{
		debug!("auto-connector supervisor started");
		while !self.cancel.load(Ordering::SeqCst) {
			if !self.session_alive() {
				self.try_connect_any();
			}

			let start = Instant::now();
			while start.elapsed() < SCAN_INTERVAL {
				if self.cancel.load(Ordering::SeqCst) {
					debug!("auto-connector supervisor cancelled");
					return;
				}
				std::thread::sleep(SCAN_SLEEP_SLICE);
			}
		}
	}

	fn session_alive(&self) -> bool
	{
		let mut slot = self.session.lock().expect("session slot poisoned");
		match slot.as_ref() {
			Some(session) if session.connected() => true,
			Some(_) => {
				// The session dropped its connection; dispose of it so the
				// next scan starts clean.
				slot.take();
				false
			},
			None => false,
		}
	}

	/// Walks the candidate list and keeps the first session whose handshake
	/// succeeds. Failures just move on to the next candidate.
	fn try_connect_any(&self)
	{
		for port_name in candidate_ports() {
			match self.try_connect(&port_name) {
				Ok(Some(session)) => {
					*self.session.lock().expect("session slot poisoned") = Some(session);
					return;
				},
				Ok(None) => {},
				Err(e) => debug!("candidate {port_name} failed: {e}"),
			}
		}
	}

	fn try_connect(&self, port_name: &str) -> Result<Option<Arc<DeviceSession>>>
	{
		let session = Arc::new(DeviceSession::new(port_name)?);
		session.set_poll_interval_ms(self.poll_interval_ms.load(Ordering::Relaxed));

		// Forward both event streams into the unified buses before the
		// handshake so the initial ConnectionChanged(true) is not lost.
		let connection_out = Arc::clone(&self.connection_events);
		session.subscribe_connection(move |connected| connection_out.emit(*connected));
		let data_out = Arc::clone(&self.data_events);
		session.subscribe_data(move |data| data_out.emit(data.clone()));

		if session.connect()? {
			Ok(Some(session))
		} else {
			Ok(None)
		}
	}
}

/// Supervisor that owns at most one live [`DeviceSession`] and re-creates it
/// whenever the device reappears.
pub struct AutoConnector
{
	shared: Arc<ConnectorShared>,
	supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AutoConnector
{
	/// Starts the supervisor thread immediately.
	pub fn start() -> Self
	{
		let shared = Arc::new(ConnectorShared {
			cancel: AtomicBool::new(false),
			poll_interval_ms: AtomicU64::new(1000),
			session: Mutex::new(None),
			connection_events: Arc::new(EventBus::new("ac-connection")),
			data_events: Arc::new(EventBus::new("ac-data")),
		});

		let worker = Arc::clone(&shared);
		let supervisor = std::thread::Builder::new()
			.name("wv-autoconnect".to_string())
			.spawn(move || worker.supervise())
			.expect("failed to spawn auto-connect supervisor");

		Self {
			shared,
			supervisor: Mutex::new(Some(supervisor)),
		}
	}

	/// Whether a session is currently connected.
	pub fn connected(&self) -> bool
	{
		self.shared
			.session
			.lock()
			.expect("session slot poisoned")
			.as_ref()
			.is_some_and(|session| session.connected())
	}

	/// The live session, if any; lets callers issue commands between polls.
	pub fn session(&self) -> Option<Arc<DeviceSession>>
	{
		self.shared.session.lock().expect("session slot poisoned").clone()
	}

	/// Sets the polling cadence, clamped to 50..=5000 ms, and forwards it to
	/// the live session (which clamps again to its own bounds).
	pub fn set_poll_interval(&self, interval_ms: u64)
	{
		let clamped = interval_ms.clamp(POLL_INTERVAL_RANGE.0, POLL_INTERVAL_RANGE.1);
		self.shared.poll_interval_ms.store(clamped, Ordering::Relaxed);
		if let Some(session) = self.session() {
			session.set_poll_interval_ms(clamped);
		}
	}

	pub fn poll_interval_ms(&self) -> u64
	{
		self.shared.poll_interval_ms.load(Ordering::Relaxed)
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

	/// Cancels the supervisor, waits up to 500 ms for it to wind down, and
	/// disposes of any live session.
	pub fn stop(&self)
	{
		self.shared.cancel.store(true, Ordering::SeqCst);

		if let Some(handle) = self.supervisor.lock().expect("supervisor slot poisoned").take() {
			let deadline = Instant::now() + STOP_TIMEOUT;
			while !handle.is_finished() && Instant::now() < deadline {
				std::thread::sleep(Duration::from_millis(10));
			}
			if handle.is_finished() {
				let _ = handle.join();
			} else {
				warn!("auto-connect supervisor did not stop within {STOP_TIMEOUT:?}, abandoning");
			}
		}

		if let Some(session) = self.shared.session.lock().expect("session slot poisoned").take() {
			session.disconnect();
		}
	}
}

impl Drop for AutoConnector
{
	fn drop(&mut self)
	{
		self.stop();
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn poll_interval_clamps_to_supervisor_range()
	{
		let connector = AutoConnector::start();
		connector.set_poll_interval(10);
		assert_eq!(connector.poll_interval_ms(), 50);
		connector.set_poll_interval(99_999);
		assert_eq!(connector.poll_interval_ms(), 5000);
		connector.set_poll_interval(250);
		assert_eq!(connector.poll_interval_ms(), 250);
		connector.stop();
	}
}
