//! Host reactor
//!
//! The thread-local stand-in for the host event loop the clock sources
//! hand their thunks to: one FIFO lane per clock class, a deadline heap
//! for timers, and an idle lane that only runs when everything else is
//! quiet.
//!
//! The reactor buffers thunks, never subscribers — queues own those. It
//! adds no ordering guarantees beyond running lanes in clock-priority
//! order, with a microtask checkpoint after every task.
//!
//! Nothing fires on its own: [`turn`] runs one pass and
//! [`run_until_idle`] loops passes, sleeping until the earliest timer
//! deadline when only future work remains.

// Imports
use {
	super::Thunk,
	core::{cell::RefCell, cmp::Reverse},
	priority_queue::PriorityQueue,
	std::{
		collections::{HashMap, VecDeque},
		thread,
		time::{Duration, Instant},
	},
};

/// Time slice handed to idle thunks as their deadline.
const IDLE_SLICE: Duration = Duration::from_millis(50);

thread_local! {
	/// Host reactor
	static HOST: RefCell<Host> = RefCell::new(Host::new());
}

/// Handle to an outstanding scheduling.
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
pub struct TaskId(u64);

/// A scheduled thunk.
struct Task {
	/// Id
	id: TaskId,

	/// Thunk
	thunk: Thunk,
}

/// An idle-lane thunk.
struct IdleTask {
	/// Id
	id: TaskId,

	/// When to run even if the host never goes idle
	force_at: Option<Instant>,

	/// Thunk
	thunk: Thunk,
}

/// FIFO lanes, in drain order.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum Lane {
	Microtask,
	Promise,
	Tick,
	Message,
	Immediate,
	Animation,
}

/// Host reactor state
struct Host {
	/// Next task id
	next_task: u64,

	/// Microtask-class lanes
	microtask: VecDeque<Task>,
	promise:   VecDeque<Task>,
	tick:      VecDeque<Task>,

	/// Task-class lanes
	message:   VecDeque<Task>,
	immediate: VecDeque<Task>,
	animation: VecDeque<Task>,

	/// Timer deadlines, earliest first
	timers: PriorityQueue<TaskId, Reverse<(Instant, u64)>>,

	/// Timer thunks
	timer_thunks: HashMap<TaskId, Thunk>,

	/// Idle lane
	idle: Vec<IdleTask>,
}

impl Host {
	fn new() -> Self {
		Self {
			next_task:    0,
			microtask:    VecDeque::new(),
			promise:      VecDeque::new(),
			tick:         VecDeque::new(),
			message:      VecDeque::new(),
			immediate:    VecDeque::new(),
			animation:    VecDeque::new(),
			timers:       PriorityQueue::new(),
			timer_thunks: HashMap::new(),
			idle:         Vec::new(),
		}
	}

	/// Allocates the next task id
	fn alloc_task(&mut self) -> TaskId {
		let id = TaskId(self.next_task);
		self.next_task += 1;
		id
	}

	fn lane(&self, lane: Lane) -> &VecDeque<Task> {
		match lane {
			Lane::Microtask => &self.microtask,
			Lane::Promise => &self.promise,
			Lane::Tick => &self.tick,
			Lane::Message => &self.message,
			Lane::Immediate => &self.immediate,
			Lane::Animation => &self.animation,
		}
	}

	fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<Task> {
		match lane {
			Lane::Microtask => &mut self.microtask,
			Lane::Promise => &mut self.promise,
			Lane::Tick => &mut self.tick,
			Lane::Message => &mut self.message,
			Lane::Immediate => &mut self.immediate,
			Lane::Animation => &mut self.animation,
		}
	}

	/// Earliest moment any future-dated work becomes due
	fn next_deadline(&self) -> Option<Instant> {
		let timer = self.timers.peek().map(|(_, &Reverse((at, _)))| at);
		let idle = self.idle.iter().filter_map(|task| task.force_at).min();
		match (timer, idle) {
			(Some(timer), Some(idle)) => Some(timer.min(idle)),
			(deadline, None) | (None, deadline) => deadline,
		}
	}

	/// Whether any timer is due at `now`
	fn timer_due(&self, now: Instant) -> bool {
		self.timers.peek().is_some_and(|(_, &Reverse((at, _)))| at <= now)
	}
}

/// Schedules `thunk` on a FIFO lane.
pub(crate) fn schedule_lane(lane: Lane, thunk: Thunk) -> TaskId {
	HOST.with(|host| {
		let mut host = host.borrow_mut();
		let id = host.alloc_task();
		host.lane_mut(lane).push_back(Task { id, thunk });
		id
	})
}

/// Schedules `thunk` to run once `delay` has elapsed.
pub(crate) fn schedule_timer(delay: Duration, thunk: Thunk) -> TaskId {
	HOST.with(|host| {
		let mut host = host.borrow_mut();
		let id = host.alloc_task();
		let seq = id.0;
		host.timers.push(id, Reverse((Instant::now() + delay, seq)));
		host.timer_thunks.insert(id, thunk);
		id
	})
}

/// Schedules `thunk` on the idle lane, optionally forced after `force_delay`.
pub(crate) fn schedule_idle(force_delay: Option<Duration>, thunk: Thunk) -> TaskId {
	HOST.with(|host| {
		let mut host = host.borrow_mut();
		let id = host.alloc_task();
		let force_at = force_delay.map(|delay| Instant::now() + delay);
		host.idle.push(IdleTask { id, force_at, thunk });
		id
	})
}

/// Cancels an outstanding scheduling.
///
/// Returns whether the task was still pending.
pub(crate) fn cancel(task: TaskId) -> bool {
	HOST.with(|host| {
		let mut host = host.borrow_mut();

		if host.timers.remove(&task).is_some() {
			host.timer_thunks.remove(&task);
			return true;
		}
		if let Some(pos) = host.idle.iter().position(|idle| idle.id == task) {
			host.idle.remove(pos);
			return true;
		}
		for lane in [
			Lane::Microtask,
			Lane::Promise,
			Lane::Tick,
			Lane::Message,
			Lane::Immediate,
			Lane::Animation,
		] {
			let lane = host.lane_mut(lane);
			if let Some(pos) = lane.iter().position(|pending| pending.id == task) {
				lane.remove(pos);
				return true;
			}
		}
		false
	})
}

/// Drains the microtask-class lanes to exhaustion.
///
/// Re-entrant pushes are picked up within the same checkpoint.
fn drain_microtasks() -> bool {
	let mut ran = false;
	loop {
		let task = HOST.with(|host| {
			let mut host = host.borrow_mut();
			host.microtask
				.pop_front()
				.or_else(|| host.promise.pop_front())
				.or_else(|| host.tick.pop_front())
		});
		match task {
			Some(task) => {
				(task.thunk)(None);
				ran = true;
			},
			None => break,
		}
	}
	ran
}

/// Runs the tasks present on `lane` at entry, with a microtask
/// checkpoint after each.
fn run_lane_pass(lane: Lane) -> bool {
	let count = HOST.with(|host| host.borrow().lane(lane).len());
	let mut ran = false;
	for _ in 0..count {
		let Some(task) = HOST.with(|host| host.borrow_mut().lane_mut(lane).pop_front()) else {
			break;
		};
		(task.thunk)(None);
		self::drain_microtasks();
		ran = true;
	}
	ran
}

/// Runs every due timer, earliest deadline first.
fn run_due_timers() -> bool {
	let mut ran = false;
	loop {
		let now = Instant::now();
		let thunk = HOST.with(|host| {
			let mut host = host.borrow_mut();
			match host.timer_due(now) {
				true => {
					let (id, _) = host.timers.pop().expect("Due timer must pop");
					let thunk = host
						.timer_thunks
						.remove(&id)
						.expect("Timer is missing its thunk");
					Some(thunk)
				},
				false => None,
			}
		});
		match thunk {
			Some(thunk) => {
				thunk(None);
				self::drain_microtasks();
				ran = true;
			},
			None => break,
		}
	}
	ran
}

/// Runs the idle lane.
///
/// Force-dated entries past their deadline run unconditionally; the rest
/// run only when nothing else ran this turn and no timer is due, each
/// receiving a time-slice deadline.
fn run_idle(other_ran: bool) -> bool {
	let mut ran = false;

	// Forced entries behave like due timers
	loop {
		let now = Instant::now();
		let task = HOST.with(|host| {
			let mut host = host.borrow_mut();
			let pos = host
				.idle
				.iter()
				.position(|task| task.force_at.is_some_and(|at| at <= now));
			pos.map(|pos| host.idle.remove(pos))
		});
		match task {
			Some(task) => {
				(task.thunk)(Some(Instant::now() + IDLE_SLICE));
				self::drain_microtasks();
				ran = true;
			},
			None => break,
		}
	}

	if other_ran || ran {
		return ran;
	}

	// The host is idle: run the entries present at entry, time-sliced
	let count = HOST.with(|host| host.borrow().idle.len());
	for _ in 0..count {
		let task = HOST.with(|host| {
			let mut host = host.borrow_mut();
			match host.idle.is_empty() {
				true => None,
				false => Some(host.idle.remove(0)),
			}
		});
		let Some(task) = task else { break };
		(task.thunk)(Some(Instant::now() + IDLE_SLICE));
		self::drain_microtasks();
		ran = true;
	}
	ran
}

/// Runs one reactor pass.
///
/// Lanes run in clock-priority order — microtask class to exhaustion,
/// then message, immediate, due timers, one animation frame, then idle —
/// with a microtask checkpoint after every task. Returns whether
/// anything ran.
pub fn turn() -> bool {
	let mut ran = false;
	ran |= self::drain_microtasks();
	ran |= self::run_lane_pass(Lane::Message);
	ran |= self::run_lane_pass(Lane::Immediate);
	ran |= self::run_due_timers();
	ran |= self::run_lane_pass(Lane::Animation);
	let idle_ran = self::run_idle(ran);
	ran |= idle_ran;
	ran
}

/// Runs reactor passes until no work remains, sleeping until the
/// earliest deadline when only future-dated work is left.
pub fn run_until_idle() {
	loop {
		while self::turn() {}

		let Some(deadline) = HOST.with(|host| host.borrow().next_deadline()) else {
			return;
		};
		let now = Instant::now();
		if deadline > now {
			thread::sleep(deadline - now);
		}
	}
}

/// Returns whether the reactor has no pending work at all.
#[must_use]
pub fn is_idle() -> bool {
	HOST.with(|host| {
		let host = host.borrow();
		host.microtask.is_empty() &&
			host.promise.is_empty() &&
			host.tick.is_empty() &&
			host.message.is_empty() &&
			host.immediate.is_empty() &&
			host.animation.is_empty() &&
			host.timers.is_empty() &&
			host.idle.is_empty()
	})
}

#[cfg(test)]
mod test {
	// Imports
	use {
		super::*,
		core::cell::Cell,
		std::rc::Rc,
	};

	#[test]
	fn lane_order_within_turn() {
		let order = Rc::new(RefCell::new(Vec::new()));

		let push = |label: &'static str| {
			let order = Rc::clone(&order);
			Box::new(move |_| order.borrow_mut().push(label)) as Thunk
		};

		self::schedule_lane(Lane::Message, push("message"));
		self::schedule_lane(Lane::Animation, push("animation"));
		self::schedule_lane(Lane::Promise, push("promise"));
		self::schedule_lane(Lane::Microtask, push("microtask"));
		self::schedule_lane(Lane::Immediate, push("immediate"));

		self::run_until_idle();
		assert_eq!(
			*order.borrow(),
			["microtask", "promise", "message", "immediate", "animation"],
		);
	}

	#[test]
	fn microtask_checkpoint_between_tasks() {
		let order = Rc::new(RefCell::new(Vec::new()));

		let order2 = Rc::clone(&order);
		self::schedule_lane(
			Lane::Message,
			Box::new(move |_| {
				order2.borrow_mut().push("task-1");
				let order3 = Rc::clone(&order2);
				self::schedule_lane(Lane::Microtask, Box::new(move |_| order3.borrow_mut().push("micro")));
			}),
		);
		let order2 = Rc::clone(&order);
		self::schedule_lane(Lane::Message, Box::new(move |_| order2.borrow_mut().push("task-2")));

		self::run_until_idle();
		assert_eq!(*order.borrow(), ["task-1", "micro", "task-2"]);
	}

	#[test]
	fn timers_fire_in_deadline_order() {
		let order = Rc::new(RefCell::new(Vec::new()));

		let order2 = Rc::clone(&order);
		self::schedule_timer(Duration::from_millis(20), Box::new(move |_| order2.borrow_mut().push(20)));
		let order2 = Rc::clone(&order);
		self::schedule_timer(Duration::from_millis(5), Box::new(move |_| order2.borrow_mut().push(5)));

		self::run_until_idle();
		assert_eq!(*order.borrow(), [5, 20]);
	}

	#[test]
	fn cancel_removes_pending() {
		let fired = Rc::new(Cell::new(false));

		let fired2 = Rc::clone(&fired);
		let task = self::schedule_timer(Duration::from_millis(1), Box::new(move |_| fired2.set(true)));
		assert!(self::cancel(task));
		assert!(!self::cancel(task), "Cancelling twice should fail");

		self::run_until_idle();
		assert!(!fired.get(), "Cancelled timer still fired");
	}

	#[test]
	fn idle_runs_last_with_deadline() {
		let order = Rc::new(RefCell::new(Vec::new()));

		let order2 = Rc::clone(&order);
		self::schedule_idle(
			None,
			Box::new(move |deadline| {
				assert!(deadline.is_some_and(|at| at > Instant::now()));
				order2.borrow_mut().push("idle");
			}),
		);
		let order2 = Rc::clone(&order);
		self::schedule_lane(Lane::Message, Box::new(move |_| order2.borrow_mut().push("message")));

		self::run_until_idle();
		assert_eq!(*order.borrow(), ["message", "idle"]);
		assert!(self::is_idle());
	}
}
