//! Location
//!
//! Debug-only capture of where a subscriber or subscription was defined,
//! surfaced in `tracing` output. Zero-sized in release builds.

// Imports
#[cfg(debug_assertions)]
use core::panic::Location;
use core::fmt;

/// Location
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug)]
pub struct Loc {
	/// Inner location
	#[cfg(debug_assertions)]
	location: &'static Location<'static>,
}

impl Loc {
	/// Gets the caller's location
	#[track_caller]
	pub const fn caller() -> Self {
		Self {
			#[cfg(debug_assertions)]
			location: Location::caller(),
		}
	}
}

impl fmt::Display for Loc {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		#[cfg(debug_assertions)]
		{
			fmt::Display::fmt(self.location, f)
		}
		#[cfg(not(debug_assertions))]
		{
			f.write_str("<unknown>")
		}
	}
}
