// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Typed event publication.
//!
//! Sessions publish connection changes and telemetry samples through an
//! [`EventBus`]. Emission is a channel send; handlers run on the bus's own
//! delivery thread, never under the emitter's locks, so a handler is free to
//! call back into the session (for example, to disconnect) without
//! deadlocking. Events are delivered in emission order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::trace;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token identifying one subscription; pass it back to
/// [`EventBus::unsubscribe`] to stop delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Registry<T>
{
	handlers: Mutex<HashMap<u64, Handler<T>>>,
	next_id: AtomicU64,
}

/// A publish/subscribe stream of `T` with a dedicated delivery thread.
pub struct EventBus<T>
{
	registry: Arc<Registry<T>>,
	sender: Sender<T>,
	delivery: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> EventBus<T>
{
	pub fn new(name: &'static str) -> Self
	{
		let registry = Arc::new(Registry {
			handlers: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(0),
		});

		let (sender, receiver) = channel::<T>();
		let worker_registry = Arc::clone(&registry);
		let delivery = std::thread::Builder::new()
			.name(format!("wv-events-{name}"))
			.spawn(move || {
				for value in receiver {
					// Snapshot the handlers so a callback can subscribe or
					// unsubscribe without deadlocking on the registry.
					let snapshot: Vec<Handler<T>> = worker_registry
						.handlers
						.lock()
						.expect("event registry poisoned")
						.values()
						.cloned()
						.collect();
					for handler in snapshot {
						handler(&value);
					}
				}
				trace!("event delivery thread {name} exiting");
			})
			.expect("failed to spawn event delivery thread");

		Self {
			registry,
			sender,
			delivery: Some(delivery),
		}
	}

	pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription
	{
		let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
		self.registry
			.handlers
			.lock()
			.expect("event registry poisoned")
			.insert(id, Arc::new(handler));
		Subscription(id)
	}

	pub fn unsubscribe(&self, subscription: Subscription)
	{
		self.registry
			.handlers
			.lock()
			.expect("event registry poisoned")
			.remove(&subscription.0);
	}

	/// Queues a value for delivery. Never blocks the emitter.
	pub fn emit(&self, value: T)
	{
		// Failure means the delivery thread is gone, i.e. we are shutting down.
		let _ = self.sender.send(value);
	}
}

impl<T> Drop for EventBus<T>
{
	fn drop(&mut self)
	{
		// Disconnect the channel so the delivery thread drains and exits.
		let (orphan, _) = channel();
		self.sender = orphan;
		if let Some(handle) = self.delivery.take() {
			let _ = handle.join();
		}
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::Arc;
	use std::sync::Mutex;
	use std::time::Duration;

	use super::*;

	fn wait_for<F: Fn() -> bool>(predicate: F)
	{
		for _ in 0..100 {
			if predicate() {
				return;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		panic!("event was not delivered in time");
	}

	#[test]
	fn delivers_in_order()
	{
		let bus = EventBus::<u32>::new("test");
		let seen = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&seen);
		let _sub = bus.subscribe(move |value| sink.lock().unwrap().push(*value));

		for value in 0..10 {
			bus.emit(value);
		}
		wait_for(|| seen.lock().unwrap().len() == 10);
		assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
	}

	#[test]
	fn unsubscribe_stops_delivery()
	{
		let bus = EventBus::<u32>::new("test");
		let seen = Arc::new(Mutex::new(Vec::new()));

		let sink = Arc::clone(&seen);
		let sub = bus.subscribe(move |value| sink.lock().unwrap().push(*value));

		bus.emit(1);
		wait_for(|| seen.lock().unwrap().len() == 1);

		bus.unsubscribe(sub);
		bus.emit(2);
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(*seen.lock().unwrap(), vec![1]);
	}

	#[test]
	fn handler_may_reenter_the_bus()
	{
		let bus = Arc::new(EventBus::<u32>::new("test"));
		let seen = Arc::new(Mutex::new(Vec::new()));

		let reentrant = Arc::clone(&bus);
		let sink = Arc::clone(&seen);
		let _sub = bus.subscribe(move |value| {
			sink.lock().unwrap().push(*value);
			if *value == 1 {
				// Subscribing from inside a handler must not deadlock.
				let _ = reentrant.subscribe(|_| {});
			}
		});

		bus.emit(1);
		wait_for(|| !seen.lock().unwrap().is_empty());
	}
}
