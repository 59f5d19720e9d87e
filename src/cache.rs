//! The delivery cache: sent-but-unacknowledged notifications plus the
//! retry buffer.
//!
//! Two FIFO containers:
//!
//! - `sent` holds notifications written to the wire, oldest first, bounded
//!   by the cache length. The protocol has no positive acknowledgment, so
//!   eviction on overflow *presumes* delivery; the bound is a best-effort
//!   trust window, not a correctness guarantee.
//! - `buffer` holds notifications that must be replayed on a fresh
//!   connection, in their original send order.
//!
//! A notification is in at most one container at a time. The store itself is
//! unsynchronized; the owning connection guards it with a single mutex that
//! also covers the write-then-cache step of the send path.

use std::collections::VecDeque;

use crate::delivery::DeliveryResult;
use crate::notification::Notification;

/// Default bound on the sent window, matching the protocol's historic
/// client default.
pub const DEFAULT_CACHE_LENGTH: usize = 100;

/// Ordered record of recently sent notifications and the retry buffer.
#[derive(Debug)]
pub struct CacheStore {
    sent: VecDeque<Notification>,
    buffer: VecDeque<Notification>,
    cache_length: usize,
    auto_adjust: bool,
}

impl CacheStore {
    /// Create a store with the given sent-window bound.
    ///
    /// When `auto_adjust` is set, a reconcile that finds no matching
    /// identifier grows the window (see [`resize_if_needed`](Self::resize_if_needed)).
    pub fn new(cache_length: usize, auto_adjust: bool) -> Self {
        Self {
            sent: VecDeque::new(),
            buffer: VecDeque::new(),
            cache_length,
            auto_adjust,
        }
    }

    /// Append one notification to the sent window, evicting the oldest
    /// entries while the window exceeds its bound. Evicted entries are
    /// presumed delivered.
    pub fn add(&mut self, notification: Notification) {
        self.sent.push_back(notification);
        while self.sent.len() > self.cache_length {
            if let Some(evicted) = self.sent.pop_front() {
                tracing::debug!(identifier = evicted.identifier(), "evicting notification from cache");
            }
        }
    }

    /// Re-insert a batch at the back of the sent window, preserving the
    /// batch's relative order. Used when a reconcile pass pulled entries out
    /// and the failure turned out not to be among them.
    pub fn add_all(&mut self, notifications: Vec<Notification>) {
        self.sent.extend(notifications);
    }

    /// Split the sent window on the identifier named by `result`.
    ///
    /// Scans oldest-first, moving each entry into `removed` until the
    /// matching identifier is found. The match itself is removed but NOT
    /// added to `removed`; it is returned. Entries newer than the match are
    /// left in place. Returns `None` if the window is exhausted without a
    /// match, in which case `removed` holds the entire former window.
    pub fn remove_all_before(
        &mut self,
        result: &DeliveryResult,
        removed: &mut Vec<Notification>,
    ) -> Option<Notification> {
        while let Some(notification) = self.sent.pop_front() {
            if notification.identifier() == result.identifier {
                return Some(notification);
            }
            removed.push(notification);
        }
        None
    }

    /// Grow the window after a no-match reconcile of `n` recovered entries.
    ///
    /// With auto-adjust enabled the bound grows by half the recovered
    /// backlog and the new length is returned; otherwise `None`, and the
    /// caller must not report a resize.
    pub fn resize_if_needed(&mut self, n: usize) -> Option<usize> {
        if self.auto_adjust {
            self.cache_length += n / 2;
            tracing::info!(cache_length = self.cache_length, "adjusted delivery cache length");
            Some(self.cache_length)
        } else {
            None
        }
    }

    /// Move every remaining sent entry into the retry buffer, in order.
    /// Returns the number moved; this is the resend count reported to the
    /// delegate.
    pub fn move_cache_to_buffer(&mut self) -> usize {
        let moved = self.sent.len();
        self.buffer.extend(self.sent.drain(..));
        moved
    }

    /// Pop the oldest retry-buffer entry, if any.
    ///
    /// The drain loop pops one entry at a time so the resend it triggers can
    /// re-enter [`add`](Self::add) between pops; iteration never touches the
    /// sent window.
    pub fn next_buffered(&mut self) -> Option<Notification> {
        self.buffer.pop_front()
    }

    /// Whether the retry buffer is empty.
    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current sent-window bound.
    pub fn cache_length(&self) -> usize {
        self.cache_length
    }

    /// Replace the sent-window bound. Takes effect on the next `add`.
    pub fn set_cache_length(&mut self, cache_length: usize) {
        self.cache_length = cache_length;
    }

    /// Number of entries currently in the sent window.
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Identifiers currently in the sent window, oldest first.
    #[cfg(test)]
    pub(crate) fn sent_identifiers(&self) -> Vec<u32> {
        self.sent.iter().map(|n| n.identifier()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryError, DeliveryResult};

    fn notification(id: u32) -> Notification {
        Notification::new(id, 0, &b"token"[..], &b"{}"[..]).unwrap()
    }

    fn store_with(ids: impl IntoIterator<Item = u32>) -> CacheStore {
        let mut store = CacheStore::new(DEFAULT_CACHE_LENGTH, false);
        for id in ids {
            store.add(notification(id));
        }
        store
    }

    fn result_for(id: u32) -> DeliveryResult {
        DeliveryResult::new(DeliveryError::InvalidToken, id)
    }

    #[test]
    fn split_on_match_partitions_the_window() {
        // Failure at the k-th entry: everything older comes out in order,
        // the match is returned, everything newer stays.
        let mut store = store_with(0..10);
        let mut removed = Vec::new();
        let matched = store.remove_all_before(&result_for(4), &mut removed);

        assert_eq!(matched.unwrap().identifier(), 4);
        let removed_ids: Vec<u32> = removed.iter().map(|n| n.identifier()).collect();
        assert_eq!(removed_ids, vec![0, 1, 2, 3]);
        assert_eq!(store.sent_identifiers(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn split_with_no_match_drains_everything() {
        let mut store = store_with(0..5);
        let mut removed = Vec::new();
        let matched = store.remove_all_before(&result_for(99), &mut removed);

        assert!(matched.is_none());
        let removed_ids: Vec<u32> = removed.iter().map(|n| n.identifier()).collect();
        assert_eq!(removed_ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(store.sent_len(), 0);
    }

    #[test]
    fn match_on_oldest_removes_nothing_else() {
        let mut store = store_with(0..3);
        let mut removed = Vec::new();
        let matched = store.remove_all_before(&result_for(0), &mut removed);
        assert_eq!(matched.unwrap().identifier(), 0);
        assert!(removed.is_empty());
        assert_eq!(store.sent_identifiers(), vec![1, 2]);
    }

    #[test]
    fn add_evicts_oldest_beyond_bound() {
        let mut store = CacheStore::new(4, false);
        for id in 0..10 {
            store.add(notification(id));
        }
        assert_eq!(store.sent_identifiers(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn add_all_preserves_relative_order() {
        let mut store = store_with([7, 8]);
        store.add_all(vec![notification(1), notification(2), notification(3)]);
        assert_eq!(store.sent_identifiers(), vec![7, 8, 1, 2, 3]);
    }

    #[test]
    fn resize_grows_by_half_the_backlog() {
        let mut store = CacheStore::new(100, true);
        assert_eq!(store.resize_if_needed(9), Some(104));
        assert_eq!(store.cache_length(), 104);
    }

    #[test]
    fn resize_disabled_reports_nothing() {
        let mut store = CacheStore::new(100, false);
        assert_eq!(store.resize_if_needed(1000), None);
        assert_eq!(store.cache_length(), 100);
    }

    #[test]
    fn move_cache_to_buffer_counts_and_orders() {
        let mut store = store_with(0..4);
        assert_eq!(store.move_cache_to_buffer(), 4);
        assert_eq!(store.sent_len(), 0);
        let mut drained = Vec::new();
        while let Some(n) = store.next_buffered() {
            drained.push(n.identifier());
        }
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }

    #[test]
    fn drain_of_empty_buffer_is_a_noop() {
        let mut store = store_with(0..2);
        assert!(store.is_buffer_empty());
        assert!(store.next_buffered().is_none());
        // Sent window untouched by buffer iteration.
        assert_eq!(store.sent_identifiers(), vec![0, 1]);
    }
}
