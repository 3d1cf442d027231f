// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Shared serial port access.
//!
//! [`SharedPort`] wraps the device's virtual serial port behind two nested
//! locks: an in-process mutex serializing threads of this process, and the
//! system-wide named lock serializing processes (see [`crate::lock`]). Both
//! are taken per transaction through the RAII [`PortTransaction`] guard, so a
//! (write command, read response) pair is atomic on the wire by construction.

use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;
use serialport::SerialPort;

use crate::error::{Error, Result};
use crate::lock::{SystemLock, SystemLockGuard};

/// Baud rate of the device's CDC-ACM port. The USB link ignores it, but the
/// OS still wants a value.
pub const BAUD_RATE: u32 = 115_200;

/// Per-operation read/write timeout.
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wall-clock budget for collecting one complete response.
pub const RESPONSE_DEADLINE: Duration = Duration::from_millis(1000);

/// Poll cadence while waiting for response bytes to arrive.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Byte-level serial operations, abstracted so tests can substitute a mock
/// for real hardware.
pub trait SerialLink: Send
{
	fn write_all(&mut self, data: &[u8]) -> Result<()>;

	/// Reads whatever is available, up to `buf.len()` bytes. A timeout with
	/// no data is not an error and reads 0 bytes; the caller decides.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

	fn bytes_to_read(&mut self) -> Result<u32>;

	fn discard_input(&mut self) -> Result<()>;

	fn set_rts(&mut self, level: bool) -> Result<()>;

	fn flush(&mut self) -> Result<()>;
}

/// Produces a freshly opened link; called whenever a transaction finds the
/// port closed.
pub type LinkFactory = Box<dyn Fn() -> Result<Box<dyn SerialLink>> + Send + Sync>;

/// The real [`SerialLink`] over a serialport handle.
struct SerialPortLink
{
	port: Box<dyn SerialPort>,
}

impl SerialLink for SerialPortLink
{
	fn write_all(&mut self, data: &[u8]) -> Result<()>
	{
		self.port.write_all(data)?;
		Ok(())
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize>
	{
		match self.port.read(buf) {
			Ok(count) => Ok(count),
			Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
			Err(e) => Err(e.into()),
		}
	}

	fn bytes_to_read(&mut self) -> Result<u32>
	{
		Ok(self.port.bytes_to_read()?)
	}

	fn discard_input(&mut self) -> Result<()>
	{
		Ok(self.port.clear(serialport::ClearBuffer::Input)?)
	}

	fn set_rts(&mut self, level: bool) -> Result<()>
	{
		Ok(self.port.write_request_to_send(level)?)
	}

	fn flush(&mut self) -> Result<()>
	{
		self.port.flush()?;
		Ok(())
	}
}

/// Opens the named port 8-N-1 at [`BAUD_RATE`] with the standard timeouts.
fn open_serial(port_name: &str) -> Result<Box<dyn SerialLink>>
{
	let normalized = normalize_port_name(port_name);
	let port = serialport::new(normalized, BAUD_RATE)
		.timeout(SERIAL_TIMEOUT)
		.data_bits(serialport::DataBits::Eight)
		.parity(serialport::Parity::None)
		.stop_bits(serialport::StopBits::One)
		.flow_control(serialport::FlowControl::None)
		.open()
		.map_err(|source| Error::PortUnavailable {
			port: port_name.to_string(),
			source,
		})?;

	Ok(Box::new(SerialPortLink {
		port,
	}))
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String
{
	#[cfg(target_os = "macos")]
	{
		// Prefer cu. over tty. so opening does not block on carrier detect.
		if name.starts_with("/dev/tty.") {
			return name.replace("/dev/tty.", "/dev/cu.");
		}
	}

	#[cfg(target_os = "windows")]
	{
		// COM ports above 9 need the device-namespace prefix.
		if let Some(number) = name.strip_prefix("COM") {
			if number.parse::<u32>().is_ok_and(|n| n > 9) {
				return format!("\\\\.\\{name}");
			}
		}
	}

	name.to_string()
}

/// A serial port shared between the threads of this process and, through the
/// named lock, with every other process on the host.
///
/// The link is opened lazily by the first transaction and stays open until
/// [`SharedPort::close`]; a caller that needs per-transaction RTS cycling can
/// close between commands and the next transaction reopens.
pub struct SharedPort
{
	factory: LinkFactory,
	link: Mutex<Option<Box<dyn SerialLink>>>,
	lock: SystemLock,
}

impl SharedPort
{
	/// Shared access to the named serial port.
	pub fn open(port_name: &str) -> Result<Self>
	{
		let name = port_name.to_string();
		Self::with_factory(Box::new(move || open_serial(&name)))
	}

	/// Shared access over caller-provided links. This is the seam mock
	/// transports plug into.
	pub fn with_factory(factory: LinkFactory) -> Result<Self>
	{
		Ok(Self {
			factory,
			link: Mutex::new(None),
			lock: SystemLock::new()?,
		})
	}

	/// Begins a transaction: takes the in-process lock, then the system-wide
	/// lock, then makes sure the link is open. Both locks are held until the
	/// returned guard drops.
	pub fn transaction(&self) -> Result<PortTransaction<'_>>
	{
		let mut link = self.link.lock().expect("port mutex poisoned");
		let guard = self.lock.acquire()?;

		if link.is_none() {
			trace!("opening serial link");
			*link = Some((self.factory)()?);
		}

		Ok(PortTransaction {
			link,
			_system: guard,
		})
	}

	/// Flushes and closes the link, leaving the port reopenable. Idempotent.
	pub fn close(&self) -> Result<()>
	{
		let mut link = self.link.lock().expect("port mutex poisoned");
		let _guard = self.lock.acquire()?;

		if let Some(mut link) = link.take() {
			trace!("closing serial link");
			link.flush()?;
		}
		Ok(())
	}
}

/// Exclusive use of the port for one command/response exchange.
pub struct PortTransaction<'p>
{
	link: MutexGuard<'p, Option<Box<dyn SerialLink>>>,
	_system: SystemLockGuard<'p>,
}

impl PortTransaction<'_>
{
	fn link(&mut self) -> &mut Box<dyn SerialLink>
	{
		self.link.as_mut().expect("Unreachable: transaction() always opens the link")
	}

	pub fn write_all(&mut self, data: &[u8]) -> Result<()>
	{
		self.link().write_all(data)
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<usize>
	{
		self.link().read(buf)
	}

	pub fn bytes_to_read(&mut self) -> Result<u32>
	{
		self.link().bytes_to_read()
	}

	pub fn discard_input(&mut self) -> Result<()>
	{
		self.link().discard_input()
	}

	pub fn set_rts(&mut self, level: bool) -> Result<()>
	{
		self.link().set_rts(level)
	}

	/// Collects exactly `len` bytes, polling the receive buffer until the
	/// response deadline elapses. A deadline with an incomplete response
	/// yields `None`; the transaction simply produced no result.
	pub fn read_exact_deadline(&mut self, len: usize) -> Result<Option<Vec<u8>>>
	{
		let mut buf = vec![0u8; len];
		let mut filled = 0usize;
		let start = Instant::now();

		while filled < len {
			if start.elapsed() >= RESPONSE_DEADLINE {
				trace!("response deadline elapsed with {filled}/{len} bytes");
				return Ok(None);
			}
			if self.bytes_to_read()? > 0 {
				filled += self.read(&mut buf[filled..])?;
			} else {
				std::thread::sleep(READ_POLL_INTERVAL);
			}
		}

		Ok(Some(buf))
	}

	/// Flushes and closes the link, ending the transaction. The next
	/// transaction reopens via the factory.
	pub fn close(mut self) -> Result<()>
	{
		if let Some(mut link) = self.link.take() {
			link.flush()?;
		}
		Ok(())
	}
}
