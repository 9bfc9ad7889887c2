//! Reactivity for `palmos`
//!
//! Reactive cells, subscribers, and the notification engine between
//! them: dependencies are declared by explicit subscribe calls, changes
//! dispatch synchronous subscribers inline and batch asynchronous ones
//! onto per-clock-source queues, and queues drain in priority order
//! through the host reactor.

// Modules
pub mod clock;
pub mod error;
mod loc;
pub mod queue;
pub mod reactive;
pub mod registry;
pub mod stamp;
pub mod subscriber;

// Exports
pub use self::{
	clock::{host, Clock, Priority, TaskId},
	error::Error,
	queue::{Queue, QueueId},
	reactive::{FirstNotify, QueueSpec, Reactive, SubscribeOptions, Subscription},
	subscriber::{AnyCell, DepArg, Subscriber, TrackingMode},
};

/// Types that may be converted into a subscriber
pub trait IntoSubscriber {
	/// Converts this type into a subscriber.
	fn into_subscriber(self) -> Subscriber;
}

#[duplicate::duplicate_item(
	T body;
	[ Subscriber ] [ self ];
	[ &'_ Subscriber ] [ self.clone() ];
)]
impl IntoSubscriber for T {
	fn into_subscriber(self) -> Subscriber {
		body
	}
}
