//! Subscribers and links
//!
//! A subscriber is a callback plus its per-queue enqueue bookkeeping. A
//! link is the edge between one cell and one subscriber; it carries the
//! dirty marker and, for asynchronous links, the target queue.
//!
//! Dirtiness is an integer protocol: a link is dirty iff its stamp
//! equals its subscriber's current call count. Bumping the call count on
//! dispatch therefore cleans every link of that subscriber in O(1),
//! without walking any list — and a cell can skip re-enqueueing its
//! async links entirely when the global counter hasn't advanced since
//! its last notification.

// Imports
use {
	crate::{
		loc::Loc,
		queue::{Queue, QueueId},
		stamp::{self, Stamp},
	},
	core::{
		any::Any,
		cell::{Cell, RefCell},
		fmt,
	},
	std::rc::Rc,
};

/// What a tracking subscriber's callback receives per dependency.
#[derive(Clone)]
pub enum DepArg {
	/// The dependency cell itself, type-erased
	Dep(AnyCell),

	/// The dependency's value (fresh or cached, by tracking mode)
	Value(Rc<dyn Any>),
}

impl DepArg {
	/// Downcasts this argument's value.
	///
	/// For [`DepArg::Dep`] this reads the cell's current value.
	#[must_use]
	pub fn value<T: Clone + 'static>(&self) -> Option<T> {
		let value = match self {
			Self::Dep(cell) => cell.value_any(),
			Self::Value(value) => Rc::clone(value),
		};
		value.downcast_ref::<T>().cloned()
	}
}

impl fmt::Debug for DepArg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Dep(cell) => f.debug_tuple("Dep").field(cell).finish(),
			Self::Value(_) => f.debug_tuple("Value").finish_non_exhaustive(),
		}
	}
}

/// Tracking mode: what a tracking subscriber's callback is passed.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrackingMode {
	/// The dependency cells themselves
	Deps,

	/// Fresh dependency values, read at dispatch
	Vals,

	/// Cached dependency values, refreshed only by the owning cell when
	/// it notifies — unchanged dependencies are never re-read
	Cache,
}

/// Type-erased cell handle.
///
/// Handed to tracking subscribers in [`TrackingMode::Deps`]; downcast to
/// recover the concrete cell.
#[derive(Clone)]
pub struct AnyCell {
	/// Inner
	inner: Rc<dyn ErasedCell>,
}

impl AnyCell {
	/// Creates a new erased handle
	pub(crate) fn new(inner: Rc<dyn ErasedCell>) -> Self {
		Self { inner }
	}

	/// Returns the cell's identity
	#[must_use]
	pub fn id(&self) -> usize {
		self.inner.id()
	}

	/// Reads the cell's current value, type-erased
	#[must_use]
	pub fn value_any(&self) -> Rc<dyn Any> {
		self.inner.value_any()
	}

	/// Downcasts to the concrete cell
	#[must_use]
	pub fn downcast<C: Clone + 'static>(&self) -> Option<C> {
		self.inner.as_any().downcast_ref::<C>().cloned()
	}
}

impl fmt::Debug for AnyCell {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AnyCell").field("id", &self.id()).finish_non_exhaustive()
	}
}

/// Object-safe view of a cell, for tracking subscribers.
pub(crate) trait ErasedCell {
	/// Reads the current value, type-erased
	fn value_any(&self) -> Rc<dyn Any>;

	/// For downcasting back to the concrete cell
	fn as_any(&self) -> &dyn Any;

	/// The cell's identity
	fn id(&self) -> usize;
}

/// A tracking subscriber's record of one dependency, in subscription
/// order.
pub(crate) struct DepRecord {
	/// Owning cell's identity
	cell_id: usize,

	/// Upgrades to the cell, if it's still alive
	upgrade: Box<dyn Fn() -> Option<AnyCell>>,

	/// Cached value ([`TrackingMode::Cache`] only)
	cached: Option<Rc<dyn Any>>,
}

impl DepRecord {
	/// Creates a new dependency record
	pub(crate) fn new(
		cell_id: usize,
		upgrade: Box<dyn Fn() -> Option<AnyCell>>,
		cached: Option<Rc<dyn Any>>,
	) -> Self {
		Self { cell_id, upgrade, cached }
	}
}

/// Callback kinds
enum Callback {
	/// Plain callback
	Plain(Box<dyn Fn()>),

	/// Tracking callback, passed its dependencies
	Tracking {
		mode: TrackingMode,
		run:  Box<dyn Fn(&[DepArg])>,
	},
}

/// Per-queue enqueue bookkeeping.
///
/// `count` is the number of this subscriber's dirty async links whose
/// target is `queue`; the subscriber sits in the queue exactly while an
/// entry exists.
struct QueuedEntry {
	/// Queue id
	id: QueueId,

	/// Dirty links targeting this queue
	count: usize,

	/// Queue
	queue: Queue,
}

/// Subscriber inner
struct Inner {
	/// Where this subscriber was defined
	defined_loc: Loc,

	/// Call counter; bumping it cleans every link of this subscriber
	call_count: Cell<Stamp>,

	/// Per-queue enqueue bookkeeping
	queued: RefCell<Vec<QueuedEntry>>,

	/// Dependency records, in subscription order (tracking only)
	tracked: RefCell<Vec<DepRecord>>,

	/// Callback
	callback: Callback,
}

/// Subscriber
///
/// A cheaply-cloneable handle; clones share the same subscriber.
pub struct Subscriber {
	/// Inner
	inner: Rc<Inner>,
}

impl Subscriber {
	/// Creates a new subscriber from a plain callback.
	#[must_use]
	#[track_caller]
	pub fn new<F>(run: F) -> Self
	where
		F: Fn() + 'static,
	{
		Self::from_callback(Callback::Plain(Box::new(run)))
	}

	/// Creates a new tracking subscriber.
	///
	/// The callback receives one [`DepArg`] per live dependency, in
	/// subscription order, shaped by `mode`.
	#[must_use]
	#[track_caller]
	pub fn tracking<F>(mode: TrackingMode, run: F) -> Self
	where
		F: Fn(&[DepArg]) + 'static,
	{
		Self::from_callback(Callback::Tracking {
			mode,
			run: Box::new(run),
		})
	}

	#[track_caller]
	fn from_callback(callback: Callback) -> Self {
		let inner = Inner {
			defined_loc: Loc::caller(),
			call_count: Cell::new(0),
			queued: RefCell::new(vec![]),
			tracked: RefCell::new(vec![]),
			callback,
		};
		Self { inner: Rc::new(inner) }
	}

	/// Returns a unique identifier for this subscriber.
	///
	/// Clones retain the same id.
	#[must_use]
	pub fn id(&self) -> usize {
		Rc::as_ptr(&self.inner) as *const () as usize
	}

	/// Returns this subscriber's tracking mode, if any.
	#[must_use]
	pub fn tracking_mode(&self) -> Option<TrackingMode> {
		match self.inner.callback {
			Callback::Plain(_) => None,
			Callback::Tracking { mode, .. } => Some(mode),
		}
	}

	/// Returns the current call counter.
	pub(crate) fn call_count(&self) -> Stamp {
		self.inner.call_count.get()
	}

	/// Notifies this subscriber.
	///
	/// The steps are contractual, in order: clear the bookkeeping entry
	/// for the queue dispatching us, dequeue from every other queue (a
	/// subscriber is notified at most once however many queues hold it),
	/// bump the call counter — implicitly cleaning every link — and only
	/// then invoke the callback. A panicking callback therefore cannot
	/// leave this subscriber mid-enqueued.
	pub(crate) fn call(&self, queue: Option<QueueId>) {
		let others = {
			let mut queued = self.inner.queued.borrow_mut();
			if let Some(id) = queue {
				if let Some(pos) = queued.iter().position(|entry| entry.id == id) {
					queued.remove(pos);
				}
			}
			queued.drain(..).map(|entry| entry.queue).collect::<Vec<_>>()
		};
		for other in &others {
			other.dequeue(self);
		}

		self.inner.call_count.set(stamp::next(self.inner.call_count.get()));

		tracing::trace!(subscriber=%self.inner.defined_loc, "Dispatching");
		match &self.inner.callback {
			Callback::Plain(run) => run(),
			Callback::Tracking { mode, run } => {
				let args = self.dep_args(*mode);
				run(&args);
			},
		}
	}

	/// Marks `link` dirty and ensures this subscriber sits in the
	/// link's queue.
	///
	/// Already-dirty (and detached) links are skipped, so a burst of
	/// changes enqueues at most once.
	pub(crate) fn enqueue(&self, link: &Link) {
		if link.is_detached() || link.is_dirty() {
			return;
		}
		link.mark_dirty();

		let queue = link
			.queue()
			.expect("Enqueued link must target a queue")
			.clone();
		let id = queue.id();
		let first = {
			let mut queued = self.inner.queued.borrow_mut();
			match queued.iter_mut().find(|entry| entry.id == id) {
				Some(entry) => {
					entry.count += 1;
					false
				},
				None => {
					queued.push(QueuedEntry {
						id,
						count: 1,
						queue: queue.clone(),
					});
					true
				},
			}
		};
		if first {
			queue.enqueue(self.clone());
		}
	}

	/// Unwinds the bookkeeping for a removed `link`.
	///
	/// Cancels the pending notification the link accounted for, and
	/// drops the dependency record for `cell_id`.
	pub(crate) fn on_unsubscribed(&self, cell_id: usize, link: &Link) {
		if link.is_dirty() {
			if let Some(queue) = link.queue() {
				let queue = queue.clone();
				let id = queue.id();
				let emptied = {
					let mut queued = self.inner.queued.borrow_mut();
					match queued.iter().position(|entry| entry.id == id) {
						Some(pos) => {
							queued[pos].count -= 1;
							match queued[pos].count {
								0 => {
									queued.remove(pos);
									true
								},
								_ => false,
							}
						},
						None => false,
					}
				};
				if emptied {
					queue.dequeue(self);
				}
			}
			link.clean();
		}

		self.inner
			.tracked
			.borrow_mut()
			.retain(|record| record.cell_id != cell_id);
	}

	/// Records a new dependency (tracking only).
	pub(crate) fn add_dep_record(&self, record: DepRecord) {
		self.inner.tracked.borrow_mut().push(record);
	}

	/// Refreshes the cached value for `cell_id`.
	pub(crate) fn update_cached(&self, cell_id: usize, value: Rc<dyn Any>) {
		let mut tracked = self.inner.tracked.borrow_mut();
		if let Some(record) = tracked.iter_mut().find(|record| record.cell_id == cell_id) {
			record.cached = Some(value);
		}
	}

	/// Builds the callback arguments for `mode`.
	///
	/// Dead dependencies are omitted.
	fn dep_args(&self, mode: TrackingMode) -> Vec<DepArg> {
		let tracked = self.inner.tracked.borrow();
		tracked
			.iter()
			.filter_map(|record| match mode {
				TrackingMode::Deps => (record.upgrade)().map(DepArg::Dep),
				TrackingMode::Vals => (record.upgrade)().map(|cell| DepArg::Value(cell.value_any())),
				TrackingMode::Cache => record.cached.clone().map(DepArg::Value),
			})
			.collect()
	}
}

impl Clone for Subscriber {
	fn clone(&self) -> Self {
		Self {
			inner: Rc::clone(&self.inner),
		}
	}
}

impl PartialEq for Subscriber {
	fn eq(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscriber")
			.field("id", &self.id())
			.field("defined_loc", &self.inner.defined_loc)
			.finish_non_exhaustive()
	}
}

/// The edge between one cell and one subscriber.
pub(crate) struct Link {
	/// Subscriber
	sub: Subscriber,

	/// Dirty stamp; dirty iff equal to the subscriber's call counter
	dirty: Cell<Stamp>,

	/// Target queue (async links only)
	queue: Option<Queue>,

	/// Set on unsubscribe; a detached link is never enqueued again
	detached: Cell<bool>,

	/// Where the subscription was made
	defined_loc: Loc,
}

impl Link {
	/// Creates a new, clean link
	pub(crate) fn new(sub: Subscriber, queue: Option<Queue>, defined_loc: Loc) -> Self {
		Self {
			sub,
			dirty: Cell::new(stamp::NEVER),
			queue,
			detached: Cell::new(false),
			defined_loc,
		}
	}

	/// Returns this link's subscriber
	pub(crate) fn subscriber(&self) -> &Subscriber {
		&self.sub
	}

	/// Returns this link's target queue
	pub(crate) fn queue(&self) -> Option<&Queue> {
		self.queue.as_ref()
	}

	/// Returns whether the subscriber has yet to observe the change
	/// this link was marked for
	pub(crate) fn is_dirty(&self) -> bool {
		self.dirty.get() == self.sub.call_count()
	}

	/// Marks this link dirty
	pub(crate) fn mark_dirty(&self) {
		self.dirty.set(self.sub.call_count());
	}

	/// Cleans this link
	pub(crate) fn clean(&self) {
		self.dirty.set(stamp::prev(self.sub.call_count()));
	}

	/// Detaches this link; it is never enqueued again
	pub(crate) fn detach(&self) {
		self.detached.set(true);
	}

	/// Returns whether this link was detached
	pub(crate) fn is_detached(&self) -> bool {
		self.detached.get()
	}

	/// Returns where the subscription was made
	pub(crate) fn defined_loc(&self) -> Loc {
		self.defined_loc
	}
}

#[cfg(test)]
mod test {
	// Imports
	use {
		super::*,
		crate::clock::Clock,
		core::cell::Cell,
		std::rc::Rc,
	};

	#[test]
	fn call_count_cleans_links() {
		let sub = Subscriber::new(|| ());
		let link = Link::new(sub.clone(), None, Loc::caller());

		assert!(!link.is_dirty(), "A fresh link must be clean");
		link.mark_dirty();
		assert!(link.is_dirty());

		sub.call(None);
		assert!(!link.is_dirty(), "A dispatch must clean every link");
	}

	#[test]
	fn enqueue_dedups_per_queue() {
		let queue = crate::registry::acquire(Clock::Manual);
		let count = Rc::new(Cell::new(0));
		let sub = {
			let count = Rc::clone(&count);
			Subscriber::new(move || count.set(count.get() + 1))
		};
		let link = Rc::new(Link::new(sub.clone(), Some(queue.clone()), Loc::caller()));

		sub.enqueue(&link);
		sub.enqueue(&link);
		assert_eq!(queue.len(), 1, "A dirty link must not re-enqueue");

		queue.flush(false);
		assert_eq!(count.get(), 1);
		assert!(!link.is_dirty(), "The dispatch must have cleaned the link");

		// Clean again, so a fresh change re-enqueues
		sub.enqueue(&link);
		assert_eq!(queue.len(), 1);
		queue.flush(false);
		assert_eq!(count.get(), 2);
	}

	#[test]
	fn detached_link_never_enqueues() {
		let queue = crate::registry::acquire(Clock::Manual);
		let sub = Subscriber::new(|| ());
		let link = Link::new(sub.clone(), Some(queue.clone()), Loc::caller());

		link.detach();
		sub.enqueue(&link);
		assert!(queue.is_empty());
	}

	#[test]
	fn unsubscribed_cancels_pending() {
		let queue = crate::registry::acquire(Clock::Manual);
		let count = Rc::new(Cell::new(0));
		let sub = {
			let count = Rc::clone(&count);
			Subscriber::new(move || count.set(count.get() + 1))
		};
		let link = Link::new(sub.clone(), Some(queue.clone()), Loc::caller());

		sub.enqueue(&link);
		assert_eq!(queue.len(), 1);

		link.detach();
		sub.on_unsubscribed(0, &link);
		assert!(queue.is_empty(), "Unsubscribing must cancel the pending notification");

		queue.flush(false);
		assert_eq!(count.get(), 0);
	}
}
