//! Outage notifications
//!
//! Delivery is someone else's problem: a [`Notifier`] is fire-and-forget.
//! What this crate guarantees is the rate: [`AlertGate`] lets at most one
//! alert through per outage, and is re-armed only after the overflow log
//! has been fully drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Notification collaborator
pub trait Notifier: Send + Sync {
    fn send_alert(&self, recipient: &str, subject: &str, body: &str);
}

/// Writes alerts to the operational log instead of sending them anywhere
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_alert(&self, recipient: &str, subject: &str, body: &str) {
        warn!(recipient, subject, body, "Alert");
    }
}

/// A delivered alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Keeps every alert in memory, for tests and embedding applications that
/// surface alerts themselves
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl Notifier for RecordingNotifier {
    fn send_alert(&self, recipient: &str, subject: &str, body: &str) {
        self.alerts.lock().push(Alert {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
    }
}

/// The alert-sent flag
#[derive(Debug, Default)]
pub struct AlertGate {
    sent: AtomicBool,
}

impl AlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per outage: for the caller that flips the
    /// flag from unset to set.
    pub fn try_claim(&self) -> bool {
        self.sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Re-arm after a full recovery
    pub fn clear(&self) {
        self.sent.store(false, Ordering::Release);
    }
}
