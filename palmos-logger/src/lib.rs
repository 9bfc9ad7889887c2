//! Logging helper
//!
//! Used by all other binaries and tests to implement consistent logging

// Imports
use tracing_subscriber::prelude::*;

/// Initializes logging.
///
/// # Panics
/// Panics if a global subscriber is already set; tests should use
/// [`try_init`] instead.
pub fn init() {
	self::registry().init();
}

/// Initializes logging, unless a global subscriber is already set.
///
/// Returns whether this call installed the subscriber. Tests race to
/// call this; only the first wins, and that's fine.
pub fn try_init() -> bool {
	self::registry().try_init().is_ok()
}

/// Builds the registry with all layers
fn registry() -> impl tracing::Subscriber + Send + Sync {
	use {std::env, tracing::level_filters::LevelFilter};

	// Check if we should use colors
	let log_use_color = env::var("RUST_LOG_COLOR").map_or(true, |value| {
		matches!(value.trim().to_uppercase().as_str(), "1" | "YES" | "TRUE")
	});

	let filter = tracing_subscriber::EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();
	let layer = tracing_subscriber::fmt::layer()
		.with_ansi(log_use_color)
		.with_filter(filter);

	tracing_subscriber::registry().with(layer)
}
