//! Reactive cell
//!
//! A read-write value that notifies its subscribers when changed.
//!
//! Subscribers register through explicit [`subscribe`](Reactive::subscribe)
//! calls — there is no implicit read-tracking — on either the synchronous
//! list (dispatched inline by [`notify`](Reactive::notify)) or an
//! asynchronous queue (dispatched when the queue drains).
//!
//! The notification protocol delivers at most one call per change to
//! each subscriber while staying fully re-entrant: callbacks may read
//! and mutate cells, subscribe, unsubscribe, flush queues, or re-enter
//! this very cell's `notify` from inside their own dispatch.

// Imports
use {
	crate::{
		clock::Clock,
		error::Error,
		loc::Loc,
		queue::Queue,
		registry, stamp,
		stamp::Stamp,
		subscriber::{AnyCell, DepRecord, ErasedCell, Link, Subscriber, TrackingMode},
		IntoSubscriber,
	},
	core::{
		any::Any,
		cell::{Cell, RefCell},
		fmt,
	},
	std::rc::Rc,
};

/// The sync-notification iteration window.
///
/// While a sync dispatch walks the list, the window lives on the cell so
/// a recursive notify of the same cell collapses into it, and removals
/// adjust it in place.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
struct SyncIter {
	/// Next index to visit
	cursor: isize,

	/// One past the last index to visit
	stop: isize,
}

/// Sentinel meaning "no sync iteration active".
const SYNC_IDLE: SyncIter = SyncIter { cursor: -1, stop: -2 };

/// Link lists
struct Links {
	/// Synchronous links, dispatched inline
	sync: Vec<Rc<Link>>,

	/// Asynchronous links, dispatched through their queues
	async_: Vec<Rc<Link>>,
}

/// Reactive inner
struct Inner<T> {
	/// Value
	value: RefCell<T>,

	/// Link lists
	links: RefCell<Links>,

	/// Global counter at the last async enqueue.
	///
	/// While the counter hasn't advanced, further notifies skip the
	/// async phase entirely: every async link is already queued.
	dirty_stamp: Cell<Stamp>,

	/// In-flight sync iteration window
	sync_iter: Cell<SyncIter>,

	/// Where this cell was defined
	defined_loc: Loc,
}

/// Reactive cell
///
/// A cheaply-cloneable handle; clones share the same cell.
pub struct Reactive<T> {
	/// Inner
	inner: Rc<Inner<T>>,
}

impl<T: Clone + 'static> Reactive<T> {
	/// Creates a new cell
	#[must_use]
	#[track_caller]
	pub fn new(value: T) -> Self {
		let inner = Inner {
			value:       RefCell::new(value),
			links:       RefCell::new(Links {
				sync:   vec![],
				async_: vec![],
			}),
			dirty_stamp: Cell::new(stamp::NEVER),
			sync_iter:   Cell::new(SYNC_IDLE),
			defined_loc: Loc::caller(),
		};
		Self { inner: Rc::new(inner) }
	}

	/// Returns a unique identifier for this cell.
	///
	/// Clones retain the same id.
	#[must_use]
	pub fn id(&self) -> usize {
		Rc::as_ptr(&self.inner).cast::<()>() as usize
	}

	/// Returns a clone of the current value. No notification.
	#[must_use]
	pub fn get(&self) -> T {
		self.with(T::clone)
	}

	/// Accesses the current value by reference. No notification.
	pub fn with<F, O>(&self, f: F) -> O
	where
		F: FnOnce(&T) -> O,
	{
		let value = self
			.inner
			.value
			.try_borrow()
			.expect("Cannot use the value while updating it");
		f(&value)
	}

	/// Stores `value` and notifies.
	#[track_caller]
	pub fn set(&self, value: T) {
		self.assume(value);
		self.notify();
	}

	/// Stores `value` without notifying.
	///
	/// For coalescing external updates; a later [`set`](Self::set) or
	/// [`notify`](Self::notify) publishes the result.
	pub fn assume(&self, value: T) {
		let mut slot = self
			.inner
			.value
			.try_borrow_mut()
			.expect("Cannot update the value while using it");
		*slot = value;
	}

	/// Updates the value in place and notifies.
	#[track_caller]
	pub fn update<F>(&self, f: F)
	where
		F: FnOnce(&mut T),
	{
		{
			let mut value = self
				.inner
				.value
				.try_borrow_mut()
				.expect("Cannot update the value while using it");
			f(&mut value);
		}
		self.notify();
	}

	/// Notifies every subscriber of a change.
	///
	/// Async first: each async link is enqueued on its queue exactly
	/// once, regardless of how the sync phase unfolds — and skipped
	/// entirely when the global counter hasn't advanced since the last
	/// enqueue (they're all still queued from it).
	///
	/// The sync phase pre-marks every link but the first dirty and walks
	/// an iteration window kept on the cell: a recursive notify of this
	/// same cell collapses into the window, and whichever frame visits a
	/// link first cleans it (by dispatching its subscriber), so the
	/// others skip it.
	#[track_caller]
	pub fn notify(&self) {
		let caller = Loc::caller();

		// Refresh cached values before anything observes this change
		self.refresh_caches();

		// --- async phase ---
		let enqueue: Vec<Rc<Link>> = {
			let links = self.inner.links.borrow();
			match !links.async_.is_empty() && stamp::global() != self.inner.dirty_stamp.get() {
				true => {
					self.inner.dirty_stamp.set(stamp::global());
					links.async_.clone()
				},
				false => vec![],
			}
		};
		for link in &enqueue {
			link.subscriber().enqueue(link);
		}

		// --- sync phase ---
		let n = self.inner.links.borrow().sync.len();
		if n == 0 {
			return;
		}
		stamp::advance_global();

		if n > 1 {
			let links = self.inner.links.borrow();
			for link in &links.sync[1..] {
				link.mark_dirty();
			}
			drop(links);
			self.inner.sync_iter.set(SyncIter {
				cursor: 1,
				stop:   n as isize,
			});
		}

		// The first subscriber runs unconditionally; it may recurse,
		// unsubscribe, or re-enter this notify
		let first = self.inner.links.borrow().sync.first().cloned();
		if let Some(link) = first {
			tracing::trace!(
				cell=%self.inner.defined_loc,
				subscription=%link.defined_loc(),
				notified=%caller,
				"Dispatching sync subscriber",
			);
			link.subscriber().call(None);
		}

		if n > 1 {
			loop {
				let next = {
					let links = self.inner.links.borrow();
					let iter = self.inner.sync_iter.get();
					match iter.cursor >= 0 && iter.cursor < iter.stop {
						true => {
							let link = Rc::clone(&links.sync[iter.cursor as usize]);
							self.inner.sync_iter.set(SyncIter {
								cursor: iter.cursor + 1,
								stop:   iter.stop,
							});
							Some(link)
						},
						false => None,
					}
				};
				match next {
					// A recursive dispatch may have cleaned the link
					// already; skip it then
					Some(link) if link.is_dirty() => link.subscriber().call(None),
					Some(_) => continue,
					None => break,
				}
			}
			// Any outer recursive frame observes the sentinel and
			// terminates its residual walk: every link is clean now
			self.inner.sync_iter.set(SYNC_IDLE);
		}
	}

	/// Subscribes `sub` to this cell.
	///
	/// Returns the new subscriber count.
	///
	/// A subscription made from inside this cell's own notification is
	/// intentionally not invoked for the in-flight change; it first
	/// fires on the next one (or immediately, with
	/// [`FirstNotify::Sync`]).
	///
	/// # Errors
	/// [`Error::AlreadySubscribed`] if a link for `sub` already exists.
	#[track_caller]
	pub fn subscribe(&self, sub: &Subscriber, opts: SubscribeOptions) -> Result<usize, Error> {
		let caller = Loc::caller();

		{
			let links = self.inner.links.borrow();
			if links
				.sync
				.iter()
				.chain(&links.async_)
				.any(|link| link.subscriber() == sub)
			{
				return Err(Error::AlreadySubscribed);
			}
		}

		let queue = match opts.queue {
			QueueSpec::Clock(Clock::Sync) => None,
			QueueSpec::Clock(clock) => Some(registry::acquire(clock)),
			QueueSpec::Queue(queue) => Some(queue),
		};

		let link = Rc::new(Link::new(sub.clone(), queue, caller));
		let count = {
			let mut links = self.inner.links.borrow_mut();
			match link.queue().is_some() {
				true => links.async_.push(Rc::clone(&link)),
				// End-append: lands beyond `stop` of an active window
				false => links.sync.push(Rc::clone(&link)),
			}
			links.sync.len() + links.async_.len()
		};

		if sub.tracking_mode().is_some() {
			let upgrade = {
				let weak = Rc::downgrade(&self.inner);
				Box::new(move || {
					let inner = weak.upgrade()?;
					let cell: Rc<dyn ErasedCell> = Rc::new(Self { inner });
					Some(AnyCell::new(cell))
				}) as Box<dyn Fn() -> Option<AnyCell>>
			};
			// Prime the cache now; only this cell refreshes it later
			let cached = (sub.tracking_mode() == Some(TrackingMode::Cache))
				.then(|| Rc::new(self.get()) as Rc<dyn Any>);
			sub.add_dep_record(DepRecord::new(self.id(), upgrade, cached));
		}

		match opts.notify {
			FirstNotify::No => {},
			FirstNotify::Sync => sub.call(None),
			FirstNotify::Queued => match link.queue().is_some() {
				true => sub.enqueue(&link),
				false => sub.call(None),
			},
		}

		Ok(count)
	}

	/// Subscribes and returns a guard that unsubscribes on drop.
	///
	/// # Errors
	/// [`Error::AlreadySubscribed`] if a link for the subscriber already
	/// exists.
	#[track_caller]
	pub fn subscribe_guard(
		&self,
		sub: impl IntoSubscriber,
		opts: SubscribeOptions,
	) -> Result<Subscription, Error> {
		let sub = sub.into_subscriber();
		self.subscribe(&sub, opts)?;

		let unsubscribe = {
			let weak = Rc::downgrade(&self.inner);
			let sub = sub.clone();
			Box::new(move || {
				if let Some(inner) = weak.upgrade() {
					// The subscriber may have been removed by other
					// means already; the guard doesn't care
					let _ = (Self { inner }).unsubscribe(&sub);
				}
			}) as Box<dyn FnOnce()>
		};
		Ok(Subscription {
			sub,
			unsubscribe: Some(unsubscribe),
		})
	}

	/// Unsubscribes `sub` from this cell, cancelling any pending
	/// notification for it.
	///
	/// Safe to call from inside a notification of this very cell: an
	/// in-flight sync iteration is adjusted in place.
	///
	/// # Errors
	/// [`Error::NotSubscribed`] if no link for `sub` exists.
	pub fn unsubscribe(&self, sub: &Subscriber) -> Result<(), Error> {
		let link = {
			let mut links = self.inner.links.borrow_mut();
			let sync_pos = links.sync.iter().position(|link| link.subscriber() == sub);
			match sync_pos {
				Some(pos) => self.remove_sync(&mut links, pos),
				None => {
					let pos = links
						.async_
						.iter()
						.position(|link| link.subscriber() == sub)
						.ok_or(Error::NotSubscribed)?;
					links.async_.remove(pos)
				},
			}
		};

		link.detach();
		sub.on_unsubscribed(self.id(), &link);
		Ok(())
	}

	/// Unsubscribes every subscriber.
	///
	/// # Errors
	/// [`Error::NotSubscribed`] if no subscriber is subscribed.
	pub fn unsubscribe_all(&self) -> Result<(), Error> {
		{
			let links = self.inner.links.borrow();
			if links.sync.is_empty() && links.async_.is_empty() {
				return Err(Error::NotSubscribed);
			}
		}

		loop {
			// One at a time, tail first, so each removal unwinds its
			// subscriber's bookkeeping without holding the list borrow
			let link = {
				let mut links = self.inner.links.borrow_mut();
				match links.async_.pop() {
					Some(link) => Some(link),
					None => match links.sync.len() {
						0 => None,
						len => Some(self.remove_sync(&mut links, len - 1)),
					},
				}
			};
			let Some(link) = link else { break };
			link.detach();
			link.subscriber().on_unsubscribed(self.id(), &link);
		}
		Ok(())
	}

	/// Returns the number of subscribed subscribers
	#[must_use]
	pub fn subscriber_count(&self) -> usize {
		let links = self.inner.links.borrow();
		links.sync.len() + links.async_.len()
	}

	/// Removes the sync link at `pos`, adjusting an in-flight iteration
	/// window.
	fn remove_sync(&self, links: &mut Links, pos: usize) -> Rc<Link> {
		let link = links.sync.remove(pos);

		let iter = self.inner.sync_iter.get();
		if iter.stop >= 0 {
			let pos = pos as isize;
			self.inner.sync_iter.set(SyncIter {
				cursor: match iter.cursor > pos {
					true => iter.cursor - 1,
					false => iter.cursor,
				},
				stop:   match iter.stop > pos {
					true => iter.stop - 1,
					false => iter.stop,
				},
			});
		}
		link
	}

	/// Refreshes this cell's cached value for every cache-tracking
	/// subscriber.
	fn refresh_caches(&self) {
		let caching: Vec<Subscriber> = {
			let links = self.inner.links.borrow();
			links
				.sync
				.iter()
				.chain(&links.async_)
				.filter(|link| link.subscriber().tracking_mode() == Some(TrackingMode::Cache))
				.map(|link| link.subscriber().clone())
				.collect()
		};
		if caching.is_empty() {
			return;
		}

		let id = self.id();
		let value: Rc<dyn Any> = Rc::new(self.get());
		for sub in caching {
			sub.update_cached(id, Rc::clone(&value));
		}
	}
}

impl<T: Clone + 'static> ErasedCell for Reactive<T> {
	fn value_any(&self) -> Rc<dyn Any> {
		Rc::new(self.get())
	}

	fn as_any(&self) -> &dyn Any {
		self
	}

	fn id(&self) -> usize {
		Self::id(self)
	}
}

impl<T> Clone for Reactive<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Rc::clone(&self.inner),
		}
	}
}

impl<T: Clone + 'static + fmt::Debug> fmt::Debug for Reactive<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let links = self.inner.links.borrow();
		f.debug_struct("Reactive")
			.field("value", &*self.inner.value.borrow())
			.field("sync_subscribers", &links.sync.len())
			.field("async_subscribers", &links.async_.len())
			.finish()
	}
}

/// Which queue a subscription dispatches through.
#[derive(Clone, Debug)]
pub enum QueueSpec {
	/// The shared queue of a clock source.
	///
	/// [`Clock::Sync`] means inline dispatch — no queue at all.
	Clock(Clock),

	/// A concrete queue
	Queue(Queue),
}

impl Default for QueueSpec {
	fn default() -> Self {
		Self::Clock(Clock::Sync)
	}
}

impl From<Clock> for QueueSpec {
	fn from(clock: Clock) -> Self {
		Self::Clock(clock)
	}
}

impl From<Queue> for QueueSpec {
	fn from(queue: Queue) -> Self {
		Self::Queue(queue)
	}
}

/// Whether — and how — a fresh subscription fires immediately.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub enum FirstNotify {
	/// Don't fire on subscribe
	#[default]
	No,

	/// Fire through the chosen queue
	Queued,

	/// Fire synchronously regardless of the chosen queue
	Sync,
}

/// Subscribe options
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
	/// Dispatch queue
	pub queue: QueueSpec,

	/// First-notification behavior
	pub notify: FirstNotify,
}

impl SubscribeOptions {
	/// Options dispatching through the shared queue of `clock`
	#[must_use]
	pub fn on(clock: Clock) -> Self {
		Self {
			queue: QueueSpec::Clock(clock),
			..Self::default()
		}
	}

	/// Options dispatching through a concrete queue
	#[must_use]
	pub fn on_queue(queue: Queue) -> Self {
		Self {
			queue: QueueSpec::Queue(queue),
			..Self::default()
		}
	}

	/// Sets the first-notification behavior
	#[must_use]
	pub fn with_first_notify(self, notify: FirstNotify) -> Self {
		Self { notify, ..self }
	}
}

/// RAII subscription guard.
///
/// Dropping the guard unsubscribes its subscriber from the cell,
/// cancelling any pending notification.
pub struct Subscription {
	/// Subscriber
	sub: Subscriber,

	/// Unsubscribes from the cell
	unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
	/// Returns the subscriber this guard owns
	#[must_use]
	pub fn subscriber(&self) -> &Subscriber {
		&self.sub
	}

	/// Unsubscribes now, consuming the guard
	pub fn unsubscribe(mut self) {
		self.release();
	}

	fn release(&mut self) {
		if let Some(unsubscribe) = self.unsubscribe.take() {
			unsubscribe();
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.release();
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription")
			.field("subscriber", &self.sub)
			.finish_non_exhaustive()
	}
}
