//! Notification stamps
//!
//! A [`Stamp`] is the integer currency of the dirty-link protocol: the
//! global notification counter, every subscriber's call counter, every
//! link's dirty flag and every cell's enqueue-dedup stamp are all stamps.
//!
//! A link is dirty iff its stamp equals its subscriber's current call
//! count, so bumping the call count cleans every link of that subscriber
//! without walking any list.

// Imports
use core::cell::Cell;

/// Stamp value.
///
/// Advancing wraps `MAX -> MIN + 1`, skipping [`NEVER`] so the sentinel
/// can never collide with a live counter value.
pub type Stamp = i64;

/// Sentinel for "never dirty"; unreachable by [`next`].
pub const NEVER: Stamp = Stamp::MIN;

thread_local! {
	/// Global notification counter.
	///
	/// Advanced on every notification event: each sync dispatch from a
	/// cell and each drain-batch boundary in a queue.
	static GLOBAL: Cell<Stamp> = const { Cell::new(0) };
}

/// Returns the stamp after `stamp`.
#[must_use]
pub const fn next(stamp: Stamp) -> Stamp {
	if stamp == Stamp::MAX {
		Stamp::MIN + 1
	} else {
		stamp + 1
	}
}

/// Returns the stamp before `stamp`.
///
/// Never called with [`NEVER`]: counters start at 0 and [`next`] skips it.
#[must_use]
pub const fn prev(stamp: Stamp) -> Stamp {
	debug_assert!(stamp != NEVER);
	if stamp == Stamp::MIN + 1 {
		Stamp::MAX
	} else {
		stamp - 1
	}
}

/// Returns the current global notification counter.
#[must_use]
pub fn global() -> Stamp {
	GLOBAL.with(Cell::get)
}

/// Advances the global notification counter, returning the new value.
pub fn advance_global() -> Stamp {
	GLOBAL.with(|global| {
		let stamp = self::next(global.get());
		global.set(stamp);
		stamp
	})
}

/// Forces the global counter to `stamp`.
///
/// Test support for driving the counter up to the wrap boundary.
#[doc(hidden)]
pub fn force_global(stamp: Stamp) {
	assert_ne!(stamp, NEVER, "The global counter can never be the sentinel");
	GLOBAL.with(|global| global.set(stamp));
}

#[cfg(test)]
mod test {
	// Imports
	use super::*;

	#[test]
	fn wraps_past_max() {
		assert_eq!(next(Stamp::MAX), Stamp::MIN + 1);
		assert_eq!(prev(Stamp::MIN + 1), Stamp::MAX);
	}

	#[test]
	fn skips_sentinel() {
		let mut stamp = Stamp::MAX;
		for _ in 0..3 {
			stamp = next(stamp);
			assert_ne!(stamp, NEVER);
		}
	}

	#[test]
	fn advance_is_monotonic_mod_wrap() {
		let before = global();
		let after = advance_global();
		assert_eq!(after, next(before));
		assert_eq!(global(), after);
	}
}
