//! Cache Module
//!
//! Provides a reference-counted cache with TTL expiration shared across
//! several keyed maps.

use std::time::Duration;

mod entry;
mod expiry;
mod list;
mod map;
mod stats;


// Re-export public types
pub use entry::{Entry, EntryId};
pub use expiry::{Cache, Expiry, Guarded, SweepOutcome};
pub use list::{EntryList, Iter};
pub use map::{Exact, ExactMap, FoldCase, FoldedMap, KeyFold, KeyMap};
pub use stats::SweepStats;

pub(crate) use expiry::sweep;

// == Public Constants ==
/// Default cadence of the background sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
