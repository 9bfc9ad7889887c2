//! Errors

/// Errors surfaced by the subscription surface.
///
/// Callback panics are deliberately *not* represented here: the core never
/// catches them, and all housekeeping completes before a callback runs, so
/// an unwinding callback cannot corrupt queue or subscriber state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// The (cell, subscriber) link already exists
	#[error("Subscriber is already subscribed to this cell")]
	AlreadySubscribed,

	/// No (cell, subscriber) link exists
	#[error("Subscriber is not subscribed to this cell")]
	NotSubscribed,

	/// A clock tag string didn't name a clock source
	#[error("Unknown clock tag `{0}`")]
	UnknownClockTag(String),
}
