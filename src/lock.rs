// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! System-wide serialization of access to WireView-class serial ports.
//!
//! All host processes that talk to these devices agree on one named lock,
//! `Global\Access_USB_Sensors`, so that a command/response transaction in one
//! process can never interleave with another process's bytes on the wire. On
//! Windows this is a named mutex (visible across user sessions); elsewhere it
//! is an advisory `flock` on a well-known file under the system temp
//! directory, which the kernel releases automatically if the holder dies.

use std::time::Duration;

use crate::error::Result;

/// Name all processes agree on. The `Global\` prefix makes the Windows mutex
/// visible across user sessions.
pub const LOCK_NAME: &str = "Global\\Access_USB_Sensors";

/// How long to wait for another process to finish its transaction.
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Handle to the named system-wide lock. Acquisition yields a guard that
/// releases exactly once on drop.
///
/// Callers must serialize in-process threads *before* acquiring this lock
/// (see `SharedPort`); the Unix backend relies on that, as `flock` does not
/// exclude threads sharing one file description.
pub struct SystemLock
{
	inner: imp::Lock,
}

/// Proof of ownership of the system-wide lock for the current transaction.
pub struct SystemLockGuard<'l>
{
	lock: &'l SystemLock,
	// A Windows mutex must be released by the acquiring thread.
	_not_send: std::marker::PhantomData<*const ()>,
}

impl SystemLock
{
	pub fn new() -> Result<Self>
	{
		Ok(Self {
			inner: imp::Lock::new()?,
		})
	}

	/// Blocks until the lock is granted or [`ACQUIRE_TIMEOUT`] elapses, in
	/// which case the port is considered busy.
	pub fn acquire(&self) -> Result<SystemLockGuard<'_>>
	{
		self.inner.acquire(ACQUIRE_TIMEOUT)?;
		Ok(SystemLockGuard {
			lock: self,
			_not_send: std::marker::PhantomData,
		})
	}
}

impl Drop for SystemLockGuard<'_>
{
	fn drop(&mut self)
	{
		self.lock.inner.release();
	}
}

#[cfg(windows)]
mod imp
{
	use std::time::Duration;

	use log::warn;
	use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT};
	use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex, WaitForSingleObject};
	use windows::core::HSTRING;

	use super::LOCK_NAME;
	use crate::error::{Error, Result};

	pub(super) struct Lock
	{
		handle: HANDLE,
	}

	// The mutex HANDLE itself may travel between threads; ownership rules are
	// enforced by the guard being !Send.
	unsafe impl Send for Lock {}
	unsafe impl Sync for Lock {}

	impl Lock
	{
		pub(super) fn new() -> Result<Self>
		{
			// Opens the existing mutex if another process created it first.
			let handle = unsafe { CreateMutexW(None, false, &HSTRING::from(LOCK_NAME)) }
				.map_err(|e| Error::Io(std::io::Error::other(e)))?;
			Ok(Self {
				handle,
			})
		}

		pub(super) fn acquire(&self, timeout: Duration) -> Result<()>
		{
			let waited = unsafe { WaitForSingleObject(self.handle, timeout.as_millis() as u32) };
			if waited == WAIT_OBJECT_0 {
				Ok(())
			} else if waited == WAIT_ABANDONED {
				// The previous owner died while holding the mutex. Ownership
				// is still granted to us; the port state may be stale but the
				// next transaction discards the input buffer anyway.
				warn!("USB sensor lock was abandoned by its previous owner; continuing");
				Ok(())
			} else if waited == WAIT_TIMEOUT {
				Err(Error::PortBusy)
			} else {
				Err(Error::Io(std::io::Error::last_os_error()))
			}
		}

		pub(super) fn release(&self)
		{
			// Both the normal and the abandoned acquisition path own the
			// mutex exactly once, so exactly one release matches.
			if let Err(e) = unsafe { ReleaseMutex(self.handle) } {
				warn!("failed to release USB sensor lock: {e}");
			}
		}
	}

	impl Drop for Lock
	{
		fn drop(&mut self)
		{
			let _ = unsafe { CloseHandle(self.handle) };
		}
	}
}

#[cfg(unix)]
mod imp
{
	use std::fs::{File, OpenOptions};
	use std::os::fd::AsRawFd;
	use std::time::{Duration, Instant};

	use log::warn;

	use super::LOCK_NAME;
	use crate::error::{Error, Result};

	/// Poll cadence while another process holds the file lock.
	const RETRY_INTERVAL: Duration = Duration::from_millis(50);

	pub(super) struct Lock
	{
		file: File,
	}

	fn lock_path() -> std::path::PathBuf
	{
		// "Global\Access_USB_Sensors" -> $TMPDIR/Access_USB_Sensors.lock
		let name = LOCK_NAME.rsplit('\\').next().unwrap_or(LOCK_NAME);
		std::env::temp_dir().join(format!("{name}.lock"))
	}

	impl Lock
	{
		pub(super) fn new() -> Result<Self>
		{
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.truncate(false)
				.open(lock_path())?;
			Ok(Self {
				file,
			})
		}

		pub(super) fn acquire(&self, timeout: Duration) -> Result<()>
		{
			let deadline = Instant::now() + timeout;
			loop {
				let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
				if rc == 0 {
					return Ok(());
				}

				let err = std::io::Error::last_os_error();
				if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
					return Err(Error::Io(err));
				}
				if Instant::now() >= deadline {
					return Err(Error::PortBusy);
				}
				std::thread::sleep(RETRY_INTERVAL);
			}
		}

		pub(super) fn release(&self)
		{
			let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
			if rc != 0 {
				warn!("failed to release USB sensor lock: {}", std::io::Error::last_os_error());
			}
		}
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	#[cfg(unix)]
	use crate::error::Error;

	#[test]
	fn acquire_release_cycles()
	{
		let lock = SystemLock::new().unwrap();
		for _ in 0..3 {
			let guard = lock.acquire().unwrap();
			drop(guard);
		}
	}

	#[cfg(unix)]
	#[test]
	fn contended_acquire_reports_busy()
	{
		// Two independent SystemLock instances are two file descriptions, so
		// they genuinely contend even within one process.
		let holder = SystemLock::new().unwrap();
		let contender = SystemLock::new().unwrap();

		let guard = holder.acquire().unwrap();
		match contender.acquire() {
			Err(Error::PortBusy) => {},
			Err(other) => panic!("expected PortBusy, got {other:?}"),
			Ok(_) => panic!("expected PortBusy, lock was granted"),
		}
		drop(guard);

		// Released: the contender now wins.
		let _guard = contender.acquire().unwrap();
	}
}
