//! Event queue and its worker

mod service;
mod worker;

pub use service::{AccessLogQueue, QueueError, QueueResult};
pub use worker::WorkerState;
