//! Queues
//!
//! A queue buffers pending subscribers for one clock source and drains
//! them cooperatively. Two drain flavors exist, chosen by the clock:
//!
//! - *Recursive* (microtask-class clocks and `manual`): a single buffer;
//!   enqueues during a drain are appended and picked up by the same drain
//!   in batch loops. `manual` degenerates to a single batch pass.
//! - *Double-buffered* (task-class clocks): the drain swaps the pending
//!   buffer out and iterates it while refills land in the fresh one,
//!   looping until both are empty, an overrun yields back to the backend,
//!   or the host deadline expires mid-iterate (the unfinished tail is
//!   then prepended back and the queue re-schedules itself).
//!
//! All drain state lives on the queue, never on the stack: a re-entered
//! drain (`flush(true)` from inside a callback) resumes the in-flight
//! iteration instead of restarting it, so nothing is double-notified.
//!
//! Before any drain runs, every registered queue of strictly lower
//! priority is drained first.

// Imports
use {
	crate::{
		clock::{Clock, Priority, TaskId, Thunk},
		registry, stamp,
		subscriber::Subscriber,
	},
	core::{
		cell::{Cell, RefCell},
		fmt, mem,
	},
	std::{
		rc::{Rc, Weak},
		time::Instant,
	},
};

/// Default pending-count past which an enqueue drains inline.
const DEFAULT_MAX_INLINE: usize = 500;

thread_local! {
	/// Next queue id
	static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Stable queue identifier.
///
/// Subscribers key their per-queue bookkeeping by this, so they never
/// hold a queue reference longer than a pending notification does.
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
pub struct QueueId(u64);

impl fmt::Display for QueueId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "queue#{}", self.0)
	}
}

/// Drain flavor
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Flavor {
	Recursive,
	Buffered,
}

impl Flavor {
	/// Flavor used for `clock`
	fn of(clock: Clock) -> Self {
		match clock {
			Clock::Microtask | Clock::Promise | Clock::Tick | Clock::Manual => Self::Recursive,
			Clock::Immediate | Clock::Message | Clock::Timeout(_) | Clock::Animation | Clock::Idle(_) =>
				Self::Buffered,
			Clock::Sync => unreachable!("`sync` dispatch has no queue"),
		}
	}
}

/// Queue state
struct State {
	/// Pending subscribers.
	///
	/// The recursive flavor drains this in place; the buffered flavor
	/// swaps it into `back` and lets refills land here.
	pending: Vec<Subscriber>,

	/// Buffer being drained (buffered flavor)
	back: Vec<Subscriber>,

	/// Drain position within the active buffer
	cursor: usize,

	/// End of the batch currently being drained
	batch_end: usize,

	/// Whether a drain is in flight
	draining: bool,

	/// Pending subscribers not yet notified
	unnotified: usize,

	/// Outstanding backend scheduling
	scheduled: Option<TaskId>,

	/// Scheduling generation; fired thunks from older generations no-op
	sched_gen: u64,
}

/// Queue inner
struct Inner {
	/// Id
	id: QueueId,

	/// Clock source
	clock: Clock,

	/// Drain flavor
	flavor: Flavor,

	/// Whether this queue drained since the last reap pass
	used: Cell<bool>,

	/// Pending-count past which an enqueue drains inline
	max_inline: Cell<usize>,

	/// Whether the inline overflow drain resumes an in-flight drain
	max_inline_recursive: Cell<bool>,

	/// State
	state: RefCell<State>,
}

/// Queue
///
/// A cheaply-cloneable handle; clones share the same queue.
pub struct Queue {
	/// Inner
	inner: Rc<Inner>,
}

impl Queue {
	/// Creates a new queue for `clock`.
	///
	/// The queue registers itself for cross-queue priority draining.
	///
	/// # Panics
	/// Panics on [`Clock::Sync`], whose dispatch is inline.
	#[must_use]
	pub fn new(clock: Clock) -> Self {
		assert!(clock.is_async(), "`sync` dispatch is inline and has no queue");

		let id = NEXT_ID.with(|next| {
			let id = next.get();
			next.set(id + 1);
			QueueId(id)
		});
		let inner = Inner {
			id,
			clock,
			flavor: Flavor::of(clock),
			used: Cell::new(false),
			max_inline: Cell::new(DEFAULT_MAX_INLINE),
			max_inline_recursive: Cell::new(true),
			state: RefCell::new(State {
				pending:    vec![],
				back:       vec![],
				cursor:     0,
				batch_end:  0,
				draining:   false,
				unnotified: 0,
				scheduled:  None,
				sched_gen:  0,
			}),
		};
		let queue = Self { inner: Rc::new(inner) };
		registry::register(queue.downgrade());
		queue
	}

	/// Downgrades this queue
	#[must_use]
	pub(crate) fn downgrade(&self) -> WeakQueue {
		WeakQueue {
			inner: Rc::downgrade(&self.inner),
		}
	}

	/// Returns this queue's id
	#[must_use]
	pub fn id(&self) -> QueueId {
		self.inner.id
	}

	/// Returns this queue's clock source
	#[must_use]
	pub fn clock(&self) -> Clock {
		self.inner.clock
	}

	/// Returns this queue's priority
	#[must_use]
	pub fn priority(&self) -> Priority {
		self.inner.clock.priority()
	}

	/// Returns the number of pending, not-yet-notified subscribers
	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.state.borrow().unnotified
	}

	/// Returns whether no subscriber awaits notification
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns whether a drain is in flight
	#[must_use]
	pub fn is_draining(&self) -> bool {
		self.inner.state.borrow().draining
	}

	/// Sets the pending-count past which an enqueue drains inline
	pub fn set_max_inline(&self, max_inline: usize) {
		self.inner.max_inline.set(max_inline);
	}

	/// Sets whether the inline overflow drain resumes an in-flight drain
	pub fn set_max_inline_recursive(&self, recursive: bool) {
		self.inner.max_inline_recursive.set(recursive);
	}

	/// Returns whether this queue drained since the last reap pass,
	/// clearing the flag.
	pub(crate) fn take_used(&self) -> bool {
		self.inner.used.replace(false)
	}

	/// Appends `sub` to the pending buffer.
	///
	/// Callers guarantee `sub` isn't already pending (via link dirty
	/// flags). Overflow past `max_inline` drains inline; otherwise a
	/// backend scheduling is requested if none is outstanding.
	pub(crate) fn enqueue(&self, sub: Subscriber) {
		let overflow = {
			let mut state = self.inner.state.borrow_mut();
			state.pending.push(sub);
			state.unnotified += 1;
			state.unnotified > self.inner.max_inline.get()
		};

		match overflow {
			true => {
				tracing::trace!(queue=%self.inner.id, "Pending count overflowed `max_inline`, draining inline");
				self.flush(self.inner.max_inline_recursive.get());
			},
			false => self.ensure_scheduled(),
		}
	}

	/// Removes a pending `sub`, searching from the tail.
	///
	/// Adjusts an in-flight drain cursor when the removal lands before
	/// it, and cancels the backend scheduling once empty.
	pub(crate) fn dequeue(&self, sub: &Subscriber) {
		let emptied = {
			let mut state = self.inner.state.borrow_mut();
			if let Some(pos) = state.pending.iter().rposition(|pending| pending == sub) {
				state.pending.remove(pos);
				if self.inner.flavor == Flavor::Recursive && state.draining {
					if pos < state.cursor {
						state.cursor -= 1;
					}
					if pos < state.batch_end {
						state.batch_end -= 1;
					}
				}
			} else if let Some(pos) = state.back.iter().rposition(|pending| pending == sub) {
				state.back.remove(pos);
				if pos < state.cursor {
					state.cursor -= 1;
				}
				if pos < state.batch_end {
					state.batch_end -= 1;
				}
			} else {
				return;
			}
			state.unnotified -= 1;
			state.unnotified == 0
		};

		if emptied {
			self.cancel_schedule();
		}
	}

	/// Synchronously drains this queue.
	///
	/// Every registered queue of strictly lower priority is fully
	/// drained first. If a drain is already in flight, `recursive`
	/// resumes it in place (the same iteration — nothing is restarted or
	/// double-notified); otherwise the call does nothing.
	pub fn flush(&self, recursive: bool) {
		{
			let state = self.inner.state.borrow();
			if state.draining {
				if !recursive {
					return;
				}
				drop(state);
				self.drain_loop(None);
				return;
			}
			if state.unnotified == 0 {
				return;
			}
		}

		registry::drain_below(self.priority());
		self.cancel_schedule();
		self.drain(None);
	}

	/// Synchronously drains this queue under a deadline.
	///
	/// The entry point for deadline-driven hosts (the idle lane uses
	/// it): once `deadline` passes mid-drain, the unfinished tail is
	/// prepended back onto the pending buffer and the queue re-schedules
	/// itself to resume. At least one subscriber is notified per call.
	///
	/// No-ops while a drain is already in flight.
	pub fn flush_with_deadline(&self, deadline: Instant) {
		{
			let state = self.inner.state.borrow();
			if state.draining || state.unnotified == 0 {
				return;
			}
		}

		registry::drain_below(self.priority());
		self.cancel_schedule();
		self.drain(Some(deadline));
	}

	/// Requests a backend scheduling if none is outstanding.
	fn ensure_scheduled(&self) {
		let gen = {
			let mut state = self.inner.state.borrow_mut();
			if state.draining || state.scheduled.is_some() || state.unnotified == 0 {
				return;
			}
			state.sched_gen += 1;
			state.sched_gen
		};

		let weak = self.downgrade();
		let thunk: Thunk = Box::new(move |deadline| {
			if let Some(queue) = weak.upgrade() {
				queue.fire(gen, deadline);
			}
		});

		let task = self.inner.clock.schedule(thunk);
		let mut state = self.inner.state.borrow_mut();
		if state.sched_gen == gen {
			state.scheduled = task;
		}
	}

	/// Invalidates and, when the clock allows, cancels the outstanding
	/// backend scheduling.
	fn cancel_schedule(&self) {
		let task = {
			let mut state = self.inner.state.borrow_mut();
			state.sched_gen += 1;
			state.scheduled.take()
		};
		if let Some(task) = task {
			let _ = self.inner.clock.cancel(task);
		}
	}

	/// Entry point for a fired backend scheduling.
	fn fire(&self, gen: u64, deadline: Option<Instant>) {
		{
			let mut state = self.inner.state.borrow_mut();
			if state.sched_gen != gen {
				return;
			}
			state.scheduled = None;
			if state.draining || state.unnotified == 0 {
				return;
			}
		}

		registry::drain_below(self.priority());
		self.drain(deadline);
	}

	/// Starts a drain.
	fn drain(&self, deadline: Option<Instant>) {
		{
			let mut state = self.inner.state.borrow_mut();
			if state.draining || state.unnotified == 0 {
				return;
			}
			state.draining = true;
			state.cursor = 0;
			state.batch_end = match self.inner.flavor {
				Flavor::Recursive => state.pending.len(),
				// The loop swaps the first window in
				Flavor::Buffered => 0,
			};
		}
		self.inner.used.set(true);

		tracing::trace!(queue=%self.inner.id, clock=%self.inner.clock, "Draining");

		// Leading batch boundary
		stamp::advance_global();
		self.drain_loop(deadline);
	}

	/// Continues the in-flight drain until done.
	///
	/// Also the resume entry for `flush(true)` re-entry: all iteration
	/// state is on the queue, so the innermost call makes progress and
	/// outer frames observe completion and unwind.
	fn drain_loop(&self, deadline: Option<Instant>) {
		match self.inner.flavor {
			Flavor::Recursive => self.drain_loop_recursive(),
			Flavor::Buffered => self.drain_loop_buffered(deadline),
		}
	}

	/// Recursive-flavor drain loop.
	fn drain_loop_recursive(&self) {
		let manual = matches!(self.inner.clock, Clock::Manual);
		loop {
			// Walk the current batch
			loop {
				let sub = {
					let mut state = self.inner.state.borrow_mut();
					if !state.draining || state.cursor >= state.batch_end {
						break;
					}
					let sub = state.pending[state.cursor].clone();
					state.cursor += 1;
					state.unnotified -= 1;
					sub
				};
				sub.call(Some(self.inner.id));
			}

			// Batch boundary
			let again = {
				let mut state = self.inner.state.borrow_mut();
				// A nested resume already finished the drain
				if !state.draining {
					break;
				}
				let new_batch = state.pending.len() - state.batch_end;
				match new_batch {
					// Nothing arrived during the batch, or `manual`
					// yields its snapshot exactly once
					0 => {
						state.pending.clear();
						state.cursor = 0;
						state.batch_end = 0;
						state.draining = false;
						false
					},
					_ if manual => {
						let batch_end = state.batch_end;
						state.pending.drain(..batch_end);
						state.cursor = 0;
						state.batch_end = 0;
						state.draining = false;
						false
					},
					_ => {
						let batch_end = state.batch_end;
						state.pending.drain(..batch_end);
						state.cursor = 0;
						state.batch_end = new_batch;
						true
					},
				}
			};
			if !again {
				break;
			}
			stamp::advance_global();
		}
	}

	/// Buffered-flavor drain step outcome.
	fn drain_loop_buffered(&self, deadline: Option<Instant>) {
		/// One step of the buffered drain
		enum Step {
			/// Notify a subscriber
			Run(Subscriber),
			/// A fresh window was swapped in; `true` on the first window
			Swapped(bool),
			/// Yield back to the backend
			Reschedule,
			/// Drain complete
			Done,
		}

		loop {
			let step = {
				let mut state = self.inner.state.borrow_mut();
				if !state.draining {
					Step::Done
				} else if state.cursor < state.batch_end {
					// Deadline exhausted: prepend the unfinished tail
					// back and resume later. The first item of a window
					// always runs, guaranteeing progress.
					let expired =
						state.cursor > 0 && deadline.is_some_and(|deadline| Instant::now() >= deadline);
					match expired {
						true => {
							let cursor = state.cursor;
							let mut tail: Vec<_> = state.back.drain(cursor..).collect();
							state.back.clear();
							let refills = mem::take(&mut state.pending);
							tail.extend(refills);
							state.pending = tail;
							state.cursor = 0;
							state.batch_end = 0;
							state.draining = false;
							Step::Reschedule
						},
						false => {
							let sub = state.back[state.cursor].clone();
							state.cursor += 1;
							state.unnotified -= 1;
							Step::Run(sub)
						},
					}
				} else {
					// Window exhausted
					state.back.clear();
					let first = state.batch_end == 0;
					if state.pending.is_empty() {
						state.cursor = 0;
						state.batch_end = 0;
						state.draining = false;
						Step::Done
					} else if !first && state.pending.len() > self.inner.max_inline.get() {
						// Overrun: let the backend re-enter us
						state.cursor = 0;
						state.batch_end = 0;
						state.draining = false;
						Step::Reschedule
					} else {
						let state = &mut *state;
						mem::swap(&mut state.pending, &mut state.back);
						state.cursor = 0;
						state.batch_end = state.back.len();
						Step::Swapped(first)
					}
				}
			};

			match step {
				Step::Run(sub) => sub.call(Some(self.inner.id)),
				// The leading boundary was stamped by `drain`
				Step::Swapped(first) =>
					if !first {
						stamp::advance_global();
					},
				Step::Reschedule => {
					tracing::trace!(queue=%self.inner.id, "Drain yielded, re-scheduling");
					self.ensure_scheduled();
					break;
				},
				Step::Done => break,
			}
		}
	}
}

impl Clone for Queue {
	fn clone(&self) -> Self {
		Self {
			inner: Rc::clone(&self.inner),
		}
	}
}

impl PartialEq for Queue {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Queue {}

impl fmt::Debug for Queue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Queue")
			.field("id", &self.inner.id)
			.field("clock", &self.inner.clock)
			.field("len", &self.len())
			.finish_non_exhaustive()
	}
}

/// Weak queue
pub(crate) struct WeakQueue {
	/// Inner
	inner: Weak<Inner>,
}

impl WeakQueue {
	/// Upgrades this weak queue
	#[must_use]
	pub(crate) fn upgrade(&self) -> Option<Queue> {
		let inner = self.inner.upgrade()?;
		Some(Queue { inner })
	}
}

#[cfg(test)]
mod test {
	// Imports
	use {
		super::*,
		crate::subscriber::Subscriber,
		core::cell::Cell,
		std::rc::Rc,
	};

	/// A counting subscriber
	fn counter() -> (Subscriber, Rc<Cell<usize>>) {
		let count = Rc::new(Cell::new(0));
		let sub = {
			let count = Rc::clone(&count);
			Subscriber::new(move || count.set(count.get() + 1))
		};
		(sub, count)
	}

	#[test]
	fn manual_yields_snapshot_once() {
		let queue = Queue::new(Clock::Manual);
		let (sub, count) = counter();

		queue.enqueue(sub.clone());
		assert_eq!(queue.len(), 1);

		queue.flush(false);
		assert_eq!(count.get(), 1);
		assert!(queue.is_empty());

		// Nothing pending, nothing runs
		queue.flush(false);
		assert_eq!(count.get(), 1);
	}

	#[test]
	fn dequeue_cancels_pending() {
		let queue = Queue::new(Clock::Manual);
		let (sub, count) = counter();

		queue.enqueue(sub.clone());
		queue.dequeue(&sub);
		assert!(queue.is_empty());

		queue.flush(false);
		assert_eq!(count.get(), 0);
	}

	#[test]
	fn manual_refills_stay_pending() {
		let queue = Queue::new(Clock::Manual);
		let count = Rc::new(Cell::new(0));

		let sub = {
			let queue = queue.clone();
			let count = Rc::clone(&count);
			// Re-enqueues a fresh subscriber during its own drain
			Subscriber::new(move || {
				count.set(count.get() + 1);
				if count.get() == 1 {
					let count = Rc::clone(&count);
					queue.enqueue(Subscriber::new(move || count.set(count.get() + 100)));
				}
			})
		};

		queue.enqueue(sub);
		queue.flush(false);

		// The refill was yielded to the next flush, not this one
		assert_eq!(count.get(), 1);
		assert_eq!(queue.len(), 1);

		queue.flush(false);
		assert_eq!(count.get(), 101);
	}
}
