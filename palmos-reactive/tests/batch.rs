//! Batch tests
//!
//! A burst of mutations delivers exactly one notification per
//! asynchronous subscriber, whatever the clock source.

// Imports
use {
	core::cell::Cell,
	palmos_reactive::{host, registry, Clock, FirstNotify, Reactive, SubscribeOptions, Subscriber},
	std::rc::Rc,
};

/// Runs a four-mutation burst against a counting subscriber on `clock`.
fn burst_once(clock: Clock) {
	palmos_logger::try_init();

	let value = Reactive::new(0);
	let count = Rc::new(Cell::new(0_usize));

	let sub = {
		let count = Rc::clone(&count);
		Subscriber::new(move || count.set(count.get() + 1))
	};
	value
		.subscribe(&sub, SubscribeOptions::on(clock))
		.expect("Unable to subscribe");

	value.set(5);
	value.set(6);
	value.update(|value| *value += 1);
	value.set(value.get() + 1);

	assert_eq!(count.get(), 0, "Nothing may fire before the queue drains");
	host::run_until_idle();

	assert_eq!(value.get(), 8);
	assert_eq!(count.get(), 1, "A burst on `{clock}` must notify exactly once");
}

#[test]
fn microtask() {
	burst_once(Clock::Microtask);
}

#[test]
fn promise() {
	burst_once(Clock::Promise);
}

#[test]
fn tick() {
	burst_once(Clock::Tick);
}

#[test]
fn immediate() {
	burst_once(Clock::Immediate);
}

#[test]
fn message() {
	burst_once(Clock::Message);
}

#[test]
fn timeout() {
	burst_once("timeout:5".parse().expect("Unable to parse the clock tag"));
}

#[test]
fn animation() {
	burst_once(Clock::Animation);
}

#[test]
fn idle() {
	burst_once(Clock::Idle(20));
}

/// A queued first notification joins the same batch as the mutations.
#[test]
fn first_notify_queued() {
	palmos_logger::try_init();

	let value = Reactive::new(0);
	let count = Rc::new(Cell::new(0_usize));

	let sub = {
		let count = Rc::clone(&count);
		Subscriber::new(move || count.set(count.get() + 1))
	};
	value
		.subscribe(
			&sub,
			SubscribeOptions::on(Clock::Microtask).with_first_notify(FirstNotify::Queued),
		)
		.expect("Unable to subscribe");
	assert_eq!(count.get(), 0, "The queued first notification must wait for the drain");

	value.set(1);
	host::run_until_idle();
	assert_eq!(count.get(), 1, "The first notification and the change must batch");
}

/// `manual` batches too, but only an explicit flush advances it.
#[test]
fn manual() {
	palmos_logger::try_init();

	let value = Reactive::new(0);
	let count = Rc::new(Cell::new(0_usize));

	let sub = {
		let count = Rc::clone(&count);
		Subscriber::new(move || count.set(count.get() + 1))
	};
	value
		.subscribe(&sub, SubscribeOptions::on(Clock::Manual))
		.expect("Unable to subscribe");

	value.set(5);
	value.set(6);

	host::run_until_idle();
	assert_eq!(count.get(), 0, "`manual` must not advance on its own");

	registry::acquire(Clock::Manual).flush(false);
	assert_eq!(count.get(), 1);
}
