//! Tracking subscriber tests
//!
//! Tracking subscribers receive their dependencies — as cells, fresh
//! values, or cached values — in subscription order.

// Imports
use {
	core::cell::{Cell, RefCell},
	palmos_reactive::{DepArg, Reactive, SubscribeOptions, Subscriber, TrackingMode},
	std::rc::Rc,
};

/// A value that counts how often it's cloned, standing in for a
/// read-counting accessor.
#[derive(Debug)]
struct Metered {
	/// Value
	value: i32,

	/// Clones so far
	clones: Rc<Cell<usize>>,
}

impl Clone for Metered {
	fn clone(&self) -> Self {
		self.clones.set(self.clones.get() + 1);
		Self {
			value:  self.value,
			clones: Rc::clone(&self.clones),
		}
	}
}

/// Cache mode reads a dependency once to prime it; mutating the *other*
/// dependencies never re-reads it.
#[test]
fn cache_mode_skips_unchanged_deps() {
	palmos_logger::try_init();

	let a = Reactive::new(0_i32);
	let reads = Rc::new(Cell::new(0_usize));
	let b = Reactive::new(Metered {
		value:  7,
		clones: Rc::clone(&reads),
	});
	let c = Reactive::new(0_i32);

	let calls = Rc::new(Cell::new(0_usize));
	let check_b = Rc::new(Cell::new(false));
	let sub = {
		let calls = Rc::clone(&calls);
		let check_b = Rc::clone(&check_b);
		Subscriber::tracking(TrackingMode::Cache, move |args: &[DepArg]| {
			calls.set(calls.get() + 1);
			assert_eq!(args.len(), 3, "All three cached dependencies must be present");
			if check_b.get() {
				let b = args[1].value::<Metered>().expect("Missing the cached value");
				assert_eq!(b.value, 8, "The cache must refresh when its own cell changes");
			}
		})
	};
	a.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");
	b.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");
	c.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");

	let primed = reads.get();
	assert!(primed > 0, "Subscribing must prime the cache");

	a.set(1);
	c.set(2);
	a.set(3);
	assert_eq!(calls.get(), 3);
	assert_eq!(
		reads.get(),
		primed,
		"Unchanged dependencies must not be re-read on dispatch",
	);

	// Changing the cached cell itself refreshes its entry
	check_b.set(true);
	b.set(Metered {
		value:  8,
		clones: Rc::clone(&reads),
	});
	assert_eq!(calls.get(), 4);
}

/// Deps mode hands the cells themselves over, in subscription order.
#[test]
fn deps_mode_passes_cells() {
	let width = Reactive::new(3_i32);
	let height = Reactive::new(4_i32);

	let areas = Rc::new(RefCell::new(Vec::new()));
	let sub = {
		let areas = Rc::clone(&areas);
		Subscriber::tracking(TrackingMode::Deps, move |args: &[DepArg]| {
			let sides = args
				.iter()
				.map(|arg| match arg {
					DepArg::Dep(cell) => cell
						.downcast::<Reactive<i32>>()
						.expect("Dependency must downcast to its concrete cell")
						.get(),
					DepArg::Value(_) => panic!("Deps mode must pass cells"),
				})
				.collect::<Vec<_>>();
			areas.borrow_mut().push(sides[0] * sides[1]);
		})
	};
	width
		.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");
	height
		.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");

	width.set(5);
	height.set(6);
	assert_eq!(*areas.borrow(), [20, 30]);
}

/// Vals mode reads fresh values at each dispatch.
#[test]
fn vals_mode_passes_fresh_values() {
	let first = Reactive::new(1_i32);
	let second = Reactive::new(2_i32);

	let sums = Rc::new(RefCell::new(Vec::new()));
	let sub = {
		let sums = Rc::clone(&sums);
		Subscriber::tracking(TrackingMode::Vals, move |args: &[DepArg]| {
			let sum = args
				.iter()
				.map(|arg| arg.value::<i32>().expect("Missing a dependency value"))
				.sum::<i32>();
			sums.borrow_mut().push(sum);
		})
	};
	first
		.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");
	second
		.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");

	first.set(10);
	second.set(20);
	assert_eq!(*sums.borrow(), [12, 30]);
}

/// Unsubscribing (or dropping) a dependency removes it from the
/// arguments.
#[test]
fn dead_deps_are_omitted() {
	let keep = Reactive::new(1_i32);

	let seen = Rc::new(Cell::new(0_usize));
	let sub = {
		let seen = Rc::clone(&seen);
		Subscriber::tracking(TrackingMode::Vals, move |args: &[DepArg]| {
			seen.set(args.len());
		})
	};
	keep.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");

	{
		let dropped = Reactive::new(2_i32);
		dropped
			.subscribe(&sub, SubscribeOptions::default())
			.expect("Unable to subscribe");

		keep.set(3);
		assert_eq!(seen.get(), 2);
	}

	// The second dependency is gone with its cell
	keep.set(4);
	assert_eq!(seen.get(), 1);

	let unsubscribed = Reactive::new(5_i32);
	unsubscribed
		.subscribe(&sub, SubscribeOptions::default())
		.expect("Unable to subscribe");
	keep.set(6);
	assert_eq!(seen.get(), 2);

	unsubscribed.unsubscribe(&sub).expect("Unable to unsubscribe");
	keep.set(7);
	assert_eq!(seen.get(), 1, "An unsubscribed dependency must drop out of the arguments");
}
