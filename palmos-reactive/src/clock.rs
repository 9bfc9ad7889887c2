//! Clock sources
//!
//! A clock source is a thin strategy for scheduling a deferred thunk on
//! the [`host`] reactor: it can schedule, and — for some variants — cancel.
//! It never buffers; buffering is the queue's job.
//!
//! Variants are ranked by [`Priority`]: when any queue is drained, every
//! queue of strictly lower priority is fully drained first.

// Modules
pub mod host;

// Exports
pub use host::TaskId;

// Imports
use {
	crate::error::Error,
	core::str::FromStr,
	std::time::{Duration, Instant},
};

/// A thunk handed to the host reactor.
///
/// Idle-lane thunks receive the host's deadline for time-slicing; every
/// other lane passes `None`.
pub(crate) type Thunk = Box<dyn FnOnce(Option<Instant>)>;

/// Clock source.
///
/// `Timeout` and `Idle` carry their delay in milliseconds; a delay `<= 0`
/// means "as soon as possible" for `Timeout` and "no forced deadline" for
/// `Idle` (`-1` is the conventional spelling of both, matching the shared
/// queue pool's default key).
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
#[derive(derive_more::Display)]
pub enum Clock {
	/// No scheduling; dispatch is inline in the cell.
	#[display("sync")]
	Sync,

	/// After the current dispatch stack unwinds.
	#[display("microtask")]
	Microtask,

	/// Same class as `Microtask`, drained just after it.
	#[display("promise")]
	Promise,

	/// High-priority microtask.
	#[display("tick")]
	Tick,

	/// Next task, no minimum delay. Cancellable.
	///
	/// On hosts without a dedicated immediate primitive this degrades to
	/// `Message`; the reactor here has a native lane for it.
	#[display("immediate")]
	Immediate,

	/// Next task via the message lane.
	#[display("message")]
	Message,

	/// A task after at least the given milliseconds. Cancellable.
	#[display("timeout:{_0}")]
	Timeout(i64),

	/// Before the next repaint frame. Cancellable.
	///
	/// May stall indefinitely on hosts that suspend frames; the reactor
	/// here fires one frame per turn.
	#[display("animation")]
	Animation,

	/// When the host reports idle, or after the given milliseconds if
	/// positive. Cancellable. Drains may be time-sliced by the host
	/// deadline.
	#[display("idle:{_0}")]
	Idle(i64),

	/// Never fires; only an explicit flush advances it.
	#[display("manual")]
	Manual,
}

impl Clock {
	/// Returns this clock's scheduling priority.
	#[must_use]
	pub const fn priority(self) -> Priority {
		match self {
			Self::Sync => Priority { class: 0, delay: 0 },
			Self::Microtask => Priority { class: 1, delay: 0 },
			Self::Promise => Priority { class: 2, delay: 0 },
			Self::Tick => Priority { class: 3, delay: 0 },
			Self::Message => Priority { class: 4, delay: 0 },
			Self::Immediate => Priority { class: 5, delay: 0 },
			Self::Timeout(ms) => Priority {
				class: 5,
				delay: if ms > 0 { ms } else { 0 },
			},
			Self::Animation => Priority { class: 6, delay: 0 },
			Self::Idle(_) => Priority { class: 7, delay: 0 },
			Self::Manual => Priority { class: 8, delay: 0 },
		}
	}

	/// Returns whether an outstanding scheduling can be cancelled.
	#[must_use]
	pub const fn cancellable(self) -> bool {
		matches!(self, Self::Immediate | Self::Timeout(_) | Self::Animation | Self::Idle(_))
	}

	/// Returns whether subscriptions on this clock are asynchronous,
	/// i.e. dispatched through a queue rather than inline.
	#[must_use]
	pub const fn is_async(self) -> bool {
		!matches!(self, Self::Sync)
	}

	/// Schedules `thunk` on the host reactor.
	///
	/// Returns `None` for `Sync` and `Manual`, which never schedule.
	pub(crate) fn schedule(self, thunk: Thunk) -> Option<TaskId> {
		let task = match self {
			Self::Sync | Self::Manual => return None,
			Self::Microtask => host::schedule_lane(host::Lane::Microtask, thunk),
			Self::Promise => host::schedule_lane(host::Lane::Promise, thunk),
			Self::Tick => host::schedule_lane(host::Lane::Tick, thunk),
			Self::Immediate => host::schedule_lane(host::Lane::Immediate, thunk),
			Self::Message => host::schedule_lane(host::Lane::Message, thunk),
			Self::Timeout(ms) => host::schedule_timer(self::delay_of(ms), thunk),
			Self::Animation => host::schedule_lane(host::Lane::Animation, thunk),
			Self::Idle(ms) => host::schedule_idle((ms > 0).then(|| self::delay_of(ms)), thunk),
		};
		Some(task)
	}

	/// Cancels an outstanding scheduling.
	///
	/// Returns whether the task was still pending. Always `false` for
	/// non-cancellable clocks, which keep their scheduling (the fired
	/// thunk is expected to no-op instead).
	pub(crate) fn cancel(self, task: TaskId) -> bool {
		match self.cancellable() {
			true => host::cancel(task),
			false => false,
		}
	}
}

/// Converts a millisecond delay to a duration, clamping negatives to zero.
fn delay_of(ms: i64) -> Duration {
	Duration::from_millis(ms.max(0) as u64)
}

impl FromStr for Clock {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		// `tag` or `tag:timeout-ms`
		let (tag, ms) = match s.split_once(':') {
			Some((tag, ms)) => {
				let ms = ms.parse::<i64>().map_err(|_| Error::UnknownClockTag(s.to_owned()))?;
				(tag, Some(ms))
			},
			None => (s, None),
		};

		let clock = match (tag, ms) {
			("sync", None) => Self::Sync,
			("microtask", None) => Self::Microtask,
			("promise", None) => Self::Promise,
			("tick", None) => Self::Tick,
			("immediate", None) => Self::Immediate,
			("message", None) => Self::Message,
			("timeout", ms) => Self::Timeout(ms.unwrap_or(-1)),
			("animation", None) => Self::Animation,
			("idle", ms) => Self::Idle(ms.unwrap_or(-1)),
			("manual", None) => Self::Manual,
			_ => return Err(Error::UnknownClockTag(s.to_owned())),
		};
		Ok(clock)
	}
}

/// Scheduling priority.
///
/// Totally ordered: `sync < microtask < promise < tick < message <
/// immediate/timeout(<=0) < timeout(N) by N < animation < idle < manual`.
/// `Microtask` and `Promise` are both microtask-class in practice; the
/// adjacent classes encode the drain tiebreak.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct Priority {
	/// Clock class
	class: u8,

	/// Timeout delay, for class 5
	delay: i64,
}

#[cfg(test)]
mod test {
	// Imports
	use super::*;

	#[test]
	fn priority_ranking() {
		let ranked = [
			Clock::Sync,
			Clock::Microtask,
			Clock::Promise,
			Clock::Tick,
			Clock::Message,
			Clock::Immediate,
			Clock::Timeout(100),
			Clock::Animation,
			Clock::Idle(-1),
			Clock::Manual,
		];
		for pair in ranked.windows(2) {
			assert!(
				pair[0].priority() < pair[1].priority(),
				"{} should rank below {}",
				pair[0],
				pair[1],
			);
		}
	}

	#[test]
	fn timeout_floats_by_delay() {
		assert_eq!(Clock::Timeout(-1).priority(), Clock::Timeout(0).priority());
		assert_eq!(Clock::Immediate.priority(), Clock::Timeout(0).priority());
		assert!(Clock::Timeout(10).priority() < Clock::Timeout(20).priority());
		assert!(Clock::Timeout(1_000_000).priority() < Clock::Animation.priority());
	}

	#[test]
	fn parse_tags() {
		assert_eq!("microtask".parse(), Ok(Clock::Microtask));
		assert_eq!("timeout:250".parse(), Ok(Clock::Timeout(250)));
		assert_eq!("timeout".parse(), Ok(Clock::Timeout(-1)));
		assert_eq!("idle:16".parse(), Ok(Clock::Idle(16)));
		assert_eq!("manual".parse(), Ok(Clock::Manual));

		assert_eq!(
			"raf".parse::<Clock>(),
			Err(Error::UnknownClockTag("raf".to_owned()))
		);
		assert_eq!(
			"timeout:soon".parse::<Clock>(),
			Err(Error::UnknownClockTag("timeout:soon".to_owned()))
		);
	}

	#[test]
	fn display_round_trips() {
		for clock in [Clock::Microtask, Clock::Timeout(250), Clock::Idle(-1), Clock::Manual] {
			assert_eq!(clock.to_string().parse(), Ok(clock));
		}
	}
}
