//! Queue registry
//!
//! The thread-wide pool of shared queues, keyed by clock source (tag and
//! timeout — [`Clock`] is the key). `acquire` lazy-creates; queues mark
//! themselves used when drained, and a reap pass removes pooled queues
//! that are empty and went unused since the previous pass.
//!
//! Reaping runs opportunistically from `acquire` — once the reap
//! interval has elapsed, or whenever the pool outgrows the size
//! threshold — and on explicit [`reap`] calls. There is no timer.
//!
//! The registry also tracks every live queue (pooled or not) so drains
//! can honour the cross-queue contract: flushing any queue fully drains
//! all strictly-lower-priority queues first.

// Imports
use {
	crate::{
		clock::{Clock, Priority},
		queue::{Queue, WeakQueue},
	},
	core::{cell::RefCell, time::Duration},
	std::{collections::HashMap, time::Instant},
};

/// Default interval between opportunistic reap passes.
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Default pool size past which a reap pass is forced.
const DEFAULT_REAP_SIZE_THRESHOLD: usize = 10;

thread_local! {
	/// Registry
	static REGISTRY: RefCell<Registry> = RefCell::new(Registry::new());
}

/// Registry state
struct Registry {
	/// Shared queues by clock source
	pool: HashMap<Clock, Queue>,

	/// Every live queue, for priority draining
	all: Vec<WeakQueue>,

	/// When the last reap pass ran
	last_reap: Instant,

	/// Interval between opportunistic reap passes; `None` disables them
	reap_interval: Option<Duration>,

	/// Pool size past which a reap pass is forced
	reap_size_threshold: usize,
}

impl Registry {
	fn new() -> Self {
		Self {
			pool:                HashMap::new(),
			all:                 Vec::new(),
			last_reap:           Instant::now(),
			reap_interval:       Some(DEFAULT_REAP_INTERVAL),
			reap_size_threshold: DEFAULT_REAP_SIZE_THRESHOLD,
		}
	}
}

/// Registers a queue for cross-queue priority draining.
///
/// Called by `Queue::new`; the registry only holds it weakly.
pub(crate) fn register(queue: WeakQueue) {
	REGISTRY.with(|registry| registry.borrow_mut().all.push(queue));
}

/// Returns the shared queue for `clock`, creating it on first use.
///
/// # Panics
/// Panics on [`Clock::Sync`], whose dispatch is inline.
#[must_use]
pub fn acquire(clock: Clock) -> Queue {
	assert!(clock.is_async(), "`sync` dispatch is inline and has no shared queue");

	self::maybe_reap();

	let existing = REGISTRY.with(|registry| registry.borrow().pool.get(&clock).cloned());
	match existing {
		Some(queue) => queue,
		None => {
			// Created outside the borrow: `Queue::new` registers itself
			let queue = Queue::new(clock);
			REGISTRY.with(|registry| {
				registry.borrow_mut().pool.insert(clock, queue.clone());
			});
			tracing::trace!(%clock, id=%queue.id(), "Created shared queue");
			queue
		},
	}
}

/// Sets the interval between opportunistic reap passes.
///
/// `None` disables periodic reaping; the size threshold still applies.
pub fn set_reap_interval(interval: Option<Duration>) {
	REGISTRY.with(|registry| registry.borrow_mut().reap_interval = interval);
}

/// Sets the pool size past which a reap pass is forced.
pub fn set_reap_size_threshold(threshold: usize) {
	REGISTRY.with(|registry| registry.borrow_mut().reap_size_threshold = threshold);
}

/// Returns the number of pooled shared queues.
#[must_use]
pub fn pool_len() -> usize {
	REGISTRY.with(|registry| registry.borrow().pool.len())
}

/// Runs a reap pass when one is due.
fn maybe_reap() {
	let due = REGISTRY.with(|registry| {
		let registry = registry.borrow();
		let interval_due = registry
			.reap_interval
			.is_some_and(|interval| registry.last_reap.elapsed() >= interval);
		interval_due || registry.pool.len() > registry.reap_size_threshold
	});
	if due {
		self::reap(false);
	}
}

/// Removes pooled queues that are empty and went unused since the last
/// pass.
///
/// `force` drops every empty queue regardless of use. Queues still
/// referenced by links stay alive (and keep their priority-drain
/// registration); they just stop being shared.
pub fn reap(force: bool) {
	REGISTRY.with(|registry| {
		let mut registry = registry.borrow_mut();
		registry.last_reap = Instant::now();

		let before = registry.pool.len();
		registry.pool.retain(|_, queue| {
			let used = queue.take_used();
			!queue.is_empty() || (used && !force)
		});
		let reaped = before - registry.pool.len();
		if reaped > 0 {
			tracing::trace!(reaped, "Reaped idle shared queues");
		}

		registry.all.retain(|queue| queue.upgrade().is_some());
	});
}

/// Fully drains every registered queue of priority strictly below
/// `priority`, lowest first, until none has anything pending.
///
/// Queues already mid-drain are skipped; their in-flight drain owns
/// them.
pub(crate) fn drain_below(priority: Priority) {
	loop {
		let next = REGISTRY.with(|registry| {
			registry
				.borrow()
				.all
				.iter()
				.filter_map(WeakQueue::upgrade)
				.filter(|queue| {
					queue.priority() < priority && !queue.is_empty() && !queue.is_draining()
				})
				.min_by_key(Queue::priority)
		});
		match next {
			Some(queue) => queue.flush(false),
			None => break,
		}
	}
}

/// Flushes every registered queue, in priority order.
pub fn flush_all(recursive: bool) {
	let mut queues = REGISTRY.with(|registry| {
		registry
			.borrow()
			.all
			.iter()
			.filter_map(WeakQueue::upgrade)
			.collect::<Vec<_>>()
	});
	queues.sort_by_key(Queue::priority);

	for queue in queues {
		queue.flush(recursive);
	}
}
