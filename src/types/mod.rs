//! Data types for the access ledger
//!
//! This module contains the value objects that flow through the queue.

mod access_event;

pub use access_event::{AccessEvent, EventCodecError, EventCodecResult, FIELD_COUNT};
