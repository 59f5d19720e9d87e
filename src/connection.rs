//! The connection coordinator: send path, error reconciliation, and the
//! lifecycle glue between them.
//!
//! Two paths touch the delivery cache and they must never interleave at
//! notification granularity:
//!
//! - the **send path** writes a frame and appends the notification to the
//!   sent window,
//! - the **reconcile path** splits the window on an inbound error frame,
//!   requeues the undetermined tail and closes the connection it arrived on.
//!
//! Exclusion is a pair of primitives with a fixed acquire order: the
//! admission gate (a one-permit semaphore) first, the cache mutex second.
//! A send acquires the gate, takes the cache lock, then releases the gate;
//! reconciliation holds the gate from before its first cache access until
//! the doomed connection is closed. A send admitted while a reconcile is in
//! progress therefore cannot write until the old connection is gone, so its
//! notification can never be misattributed to the failed connection.
//!
//! Reconciliation runs on a dedicated worker task fed by the provider's
//! event queue, keeping the transport read loop free of delegate callbacks
//! and cache work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

use crate::cache::{CacheStore, DEFAULT_CACHE_LENGTH};
use crate::delegate::ApnsDelegate;
use crate::delivery::DeliveryResult;
use crate::error::ApnsError;
use crate::notification::Notification;
use crate::provider::{ChannelEvent, ChannelProvider, ProviderError, PushChannel};

/// Write attempts per notification before the failure is surfaced.
const SEND_RETRIES: u32 = 3;
/// Delay between write attempts.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// How long `close` waits for queued reconcile work to finish.
const SHUTDOWN_DRAIN_WAIT: Duration = Duration::from_secs(30);

/// Construction-time configuration, supplied by the surrounding service.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the sent-notification window.
    pub cache_length: usize,
    /// Grow the window when a reconcile finds no matching identifier.
    pub auto_adjust_cache_length: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cache_length: DEFAULT_CACHE_LENGTH,
            auto_adjust_cache_length: true,
        }
    }
}

/// A persistent client connection to the push service.
///
/// Owns the delivery cache and its reconciliation with the asynchronous
/// error channel. Concurrent callers may send through a shared reference;
/// ordering within one physical connection follows the order in which
/// callers win the send critical section.
pub struct ApnsConnection<P: ChannelProvider, D: ApnsDelegate> {
    inner: Arc<Inner<P, D>>,
    events: UnboundedSender<ChannelEvent>,
    worker: SyncMutex<Option<JoinHandle<()>>>,
}

struct Inner<P: ChannelProvider, D: ApnsDelegate> {
    provider: P,
    delegate: D,
    cache: AsyncMutex<CacheStore>,
    /// Admission gate. One permit; held by reconciliation for the whole
    /// split-requeue-close sequence.
    gate: Semaphore,
    /// The channel the most recent successful write went out on. Reconcile
    /// closes it; the provider treats a superseded handle as a no-op.
    last_channel: SyncMutex<Option<P::Channel>>,
    closing: AtomicBool,
}

impl<P: ChannelProvider, D: ApnsDelegate> ApnsConnection<P, D> {
    /// Create a connection over `provider` and start its reconcile worker.
    ///
    /// `events` must be the receiving end of the queue the provider reports
    /// into; `events_tx` a sender for the same queue (used to order the
    /// shutdown marker behind in-flight events).
    pub fn new(
        provider: P,
        delegate: D,
        config: ConnectionConfig,
        events_tx: UnboundedSender<ChannelEvent>,
        events: UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        let inner = Arc::new(Inner {
            provider,
            delegate,
            cache: AsyncMutex::new(CacheStore::new(
                config.cache_length,
                config.auto_adjust_cache_length,
            )),
            gate: Semaphore::new(1),
            last_channel: SyncMutex::new(None),
            closing: AtomicBool::new(false),
        });
        let worker = tokio::spawn(run_worker(inner.clone(), events));
        Self {
            inner,
            events: events_tx,
            worker: SyncMutex::new(Some(worker)),
        }
    }

    /// Send one notification.
    ///
    /// Returns once the frame is written and cached, or with an error after
    /// the retry bound is exhausted or the provider/connection is closed.
    /// Soft outcomes (a later error frame naming this notification) surface
    /// through the delegate, not here.
    pub async fn send_message(&self, notification: Notification) -> Result<(), ApnsError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(ApnsError::ConnectionClosed);
        }
        self.inner.send(&notification, false).await
    }

    /// Current delivery-cache bound.
    pub async fn cache_length(&self) -> usize {
        self.inner.cache.lock().await.cache_length()
    }

    /// Replace the delivery-cache bound.
    pub async fn set_cache_length(&self, cache_length: usize) {
        self.inner.cache.lock().await.set_cache_length(cache_length);
    }

    /// Shut down: stop admitting sends, wait (bounded) for queued reconcile
    /// work to drain, then close the provider.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        // The marker queues behind any events already in flight, so the
        // worker finishes outstanding reconciles before it exits.
        let _ = self.events.send(ChannelEvent::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(SHUTDOWN_DRAIN_WAIT, worker).await.is_err() {
                tracing::warn!(
                    wait = ?SHUTDOWN_DRAIN_WAIT,
                    "reconcile worker did not drain in time, closing anyway"
                );
            }
        }
        self.inner.gate.close();
        self.inner.provider.close().await;
    }
}

impl<P: ChannelProvider, D: ApnsDelegate> Inner<P, D> {
    async fn send(&self, notification: &Notification, from_buffer: bool) -> Result<(), ApnsError> {
        let frame = notification.frame().clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            // Gate first, cache second. The gate is released as soon as the
            // cache is held: it only exists to keep new writes out while a
            // reconcile owns the cache-and-close sequence.
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ApnsError::ConnectionClosed)?;
            let mut cache = self.cache.lock().await;
            drop(permit);

            let written = self
                .provider
                .run_with_channel(|channel| {
                    let frame = frame.clone();
                    async move {
                        channel.write_frame(&frame).await?;
                        Ok(channel)
                    }
                })
                .await;

            match written {
                Ok(channel) => {
                    *self.last_channel.lock() = Some(channel);
                    cache.add(notification.clone());
                    drop(cache);
                    tracing::debug!(
                        identifier = notification.identifier(),
                        from_buffer,
                        "notification sent"
                    );
                    self.delegate.message_sent(notification, from_buffer);
                    return Ok(());
                }
                Err(ProviderError::Closed) => {
                    return Err(ApnsError::ProviderClosed);
                }
                Err(ProviderError::Connect(e)) | Err(ProviderError::Io(e)) => {
                    drop(cache);
                    if attempt >= SEND_RETRIES {
                        let error = ApnsError::RetriesExhausted {
                            original: e,
                            attempts: attempt,
                        };
                        self.delegate.message_send_failed(Some(notification), &error);
                        return Err(error);
                    }
                    tracing::warn!(
                        error = %e,
                        attempt,
                        identifier = notification.identifier(),
                        "send failed, will retry"
                    );
                    tokio::time::sleep(SEND_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Reconcile the cache against one inbound error frame, then replay the
    /// retry buffer on a fresh connection.
    async fn on_delivery_result(&self, result: DeliveryResult) {
        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => return, // shutting down
        };

        {
            let mut cache = self.cache.lock().await;

            let mut removed = Vec::new();
            match cache.remove_all_before(&result, &mut removed) {
                Some(notification) => {
                    // The one confirmed failure. Everything older was
                    // processed before it and is presumed delivered.
                    tracing::debug!(
                        identifier = notification.identifier(),
                        error = %result.error,
                        presumed_delivered = removed.len(),
                        "notification rejected by server"
                    );
                    self.delegate.message_send_failed(
                        Some(&notification),
                        &ApnsError::Delivery(result.error),
                    );
                }
                None => {
                    // The failing notification already fell out of the
                    // window: some notification failed but we no longer know
                    // which, and nothing can be presumed delivered.
                    let recovered = removed.len();
                    tracing::warn!(
                        identifier = result.identifier,
                        recovered,
                        "error frame references a notification missing from the cache; cache may be too small"
                    );
                    self.delegate
                        .message_send_failed(None, &ApnsError::Delivery(result.error));
                    cache.add_all(removed);
                    if let Some(new_length) = cache.resize_if_needed(recovered) {
                        self.delegate.cache_length_exceeded(new_length);
                    }
                }
            }

            let resent = cache.move_cache_to_buffer();
            self.delegate.notifications_resent(resent);
            self.delegate.connection_closed(result.error, result.identifier);

            // Close the connection the error arrived on before letting any
            // gated send proceed; the peer is about to drop it anyway and
            // nothing more may be written there. The cache stays locked so
            // the next write observes the closed channel.
            let channel = self.last_channel.lock().take();
            if let Some(channel) = channel {
                self.provider.close_channel(&channel).await;
            }
        }

        drop(permit);
        self.drain_buffer().await;
    }

    /// Replay the retry buffer through the ordinary send path. Pops one
    /// entry at a time so each resend retakes the gate and cache like any
    /// other send.
    async fn drain_buffer(&self) {
        loop {
            let next = { self.cache.lock().await.next_buffered() };
            let Some(notification) = next else { break };
            tracing::debug!(
                identifier = notification.identifier(),
                "resending notification from buffer"
            );
            if let Err(e) = self.send(&notification, true).await {
                tracing::warn!(
                    error = %e,
                    identifier = notification.identifier(),
                    "failed to resend buffered notification"
                );
                if matches!(e, ApnsError::ProviderClosed | ApnsError::ConnectionClosed) {
                    break;
                }
            }
        }
    }

    fn on_channel_closed(&self, generation: u64) {
        let mut last = self.last_channel.lock();
        if last.as_ref().is_some_and(|c| c.generation() == generation) {
            *last = None;
        }
        tracing::debug!(generation, "channel closed");
    }
}

/// The single-concurrency reconcile queue: one worker drains the provider's
/// event stream in order.
async fn run_worker<P: ChannelProvider, D: ApnsDelegate>(
    inner: Arc<Inner<P, D>>,
    mut events: UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::DeliveryResult(result) => inner.on_delivery_result(result).await,
            ChannelEvent::Closed(generation) => inner.on_channel_closed(generation),
            ChannelEvent::Shutdown => break,
        }
    }
}
