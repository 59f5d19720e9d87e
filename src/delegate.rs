//! Lifecycle-event sink for user code.
//!
//! The connection reports every terminal outcome through this trait: a
//! failure is either retried internally or reported here, never silently
//! dropped. Callbacks run on the connection's worker task or inside a send
//! call; implementations should return promptly.

use crate::delivery::DeliveryError;
use crate::error::ApnsError;
use crate::notification::Notification;

/// Receives connection lifecycle events. All methods default to no-ops so
/// implementors can pick the events they care about.
pub trait ApnsDelegate: Send + Sync + 'static {
    /// A notification was written to the wire. `resent` is true when it came
    /// back out of the retry buffer after an error reconcile.
    fn message_sent(&self, notification: &Notification, resent: bool) {
        let _ = (notification, resent);
    }

    /// A notification definitively failed. `notification` is `None` when the
    /// server referenced an identifier no longer in the delivery cache, so
    /// the failed notification's identity is unknown.
    fn message_send_failed(&self, notification: Option<&Notification>, error: &ApnsError) {
        let _ = (notification, error);
    }

    /// A reconcile moved this many notifications into the retry buffer for
    /// replay on a fresh connection.
    fn notifications_resent(&self, count: usize) {
        let _ = count;
    }

    /// The connection that produced an error frame is being closed.
    fn connection_closed(&self, error: DeliveryError, identifier: u32) {
        let _ = (error, identifier);
    }

    /// The delivery cache grew after a reconcile found no match.
    fn cache_length_exceeded(&self, new_length: usize) {
        let _ = new_length;
    }
}

/// Delegate that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl ApnsDelegate for NoopDelegate {}
