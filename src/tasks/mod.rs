//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is started.
//!
//! # Tasks
//! - Expiration sweep: reclaims idle cache entries at a fixed cadence

mod sweep;

pub use sweep::{spawn_sweep_task, SweepHandle};
