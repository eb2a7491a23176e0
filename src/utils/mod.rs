//! Utility functions and helpers
//!
//! Atomic file replacement and timestamp helpers.

pub mod atomic;
pub mod time;

pub use atomic::{atomic_write, atomic_write_with};
pub use time::{millis_to_rfc3339, now_millis, now_rfc3339};
