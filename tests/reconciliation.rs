//! Integration tests for cache reconciliation against injected error
//! frames, driven through an in-memory channel provider.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use apns_stream::{
    ApnsConnection, ApnsDelegate, ApnsError, ChannelEvent, ChannelProvider, ConnectionConfig,
    DeliveryError, DeliveryResult, Notification, ProviderError, PushChannel,
};

/// In-memory stand-in for one physical connection: records every frame
/// written to it.
#[derive(Clone)]
struct MockChannel {
    generation: u64,
    closed: Arc<AtomicBool>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_writes: Arc<AtomicU32>,
}

impl PushChannel for MockChannel {
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) > 0 {
            self.fail_writes.fetch_sub(1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "injected write failure",
            ));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed"));
        }
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
struct MockProviderInner {
    current: Mutex<Option<MockChannel>>,
    connections: Mutex<Vec<MockChannel>>,
    fail_writes: Arc<AtomicU32>,
    closed: AtomicBool,
    next_generation: AtomicU64,
}

/// Provider that mints in-memory channels on demand.
#[derive(Clone, Default)]
struct MockProvider {
    inner: Arc<MockProviderInner>,
}

impl MockProvider {
    fn fail_next_writes(&self, n: u32) {
        self.inner.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Identifiers written per connection, in write order. Assumes
    /// enhanced-format frames.
    fn written_identifiers(&self) -> Vec<Vec<u32>> {
        self.inner
            .connections
            .lock()
            .iter()
            .map(|c| {
                c.frames
                    .lock()
                    .iter()
                    .map(|f| u32::from_be_bytes([f[1], f[2], f[3], f[4]]))
                    .collect()
            })
            .collect()
    }
}

impl ChannelProvider for MockProvider {
    type Channel = MockChannel;

    async fn run_with_channel<F, Fut, T>(&self, action: F) -> Result<T, ProviderError>
    where
        F: FnOnce(Self::Channel) -> Fut + Send,
        Fut: std::future::Future<Output = io::Result<T>> + Send,
        T: Send,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        let channel = {
            let mut current = self.inner.current.lock();
            match &*current {
                Some(c) if !c.closed.load(Ordering::SeqCst) => c.clone(),
                _ => {
                    let c = MockChannel {
                        generation: self.inner.next_generation.fetch_add(1, Ordering::SeqCst),
                        closed: Arc::new(AtomicBool::new(false)),
                        frames: Arc::new(Mutex::new(Vec::new())),
                        fail_writes: self.inner.fail_writes.clone(),
                    };
                    self.inner.connections.lock().push(c.clone());
                    *current = Some(c.clone());
                    c
                }
            }
        };
        action(channel).await.map_err(ProviderError::Io)
    }

    async fn close_channel(&self, channel: &Self::Channel) {
        let mut current = self.inner.current.lock();
        if current
            .as_ref()
            .is_some_and(|c| c.generation == channel.generation)
        {
            channel.closed.store(true, Ordering::SeqCst);
            *current = None;
        }
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.current.lock().take();
    }
}

#[derive(Default)]
struct Recorded {
    sent: Vec<(u32, bool)>,
    failed: Vec<Option<u32>>,
    resent_counts: Vec<usize>,
    closed: Vec<(DeliveryError, u32)>,
    cache_resized: Vec<usize>,
}

#[derive(Clone, Default)]
struct RecordingDelegate {
    recorded: Arc<Mutex<Recorded>>,
}

impl ApnsDelegate for RecordingDelegate {
    fn message_sent(&self, notification: &Notification, resent: bool) {
        self.recorded
            .lock()
            .sent
            .push((notification.identifier(), resent));
    }

    fn message_send_failed(&self, notification: Option<&Notification>, _error: &ApnsError) {
        self.recorded
            .lock()
            .failed
            .push(notification.map(|n| n.identifier()));
    }

    fn notifications_resent(&self, count: usize) {
        self.recorded.lock().resent_counts.push(count);
    }

    fn connection_closed(&self, error: DeliveryError, identifier: u32) {
        self.recorded.lock().closed.push((error, identifier));
    }

    fn cache_length_exceeded(&self, new_length: usize) {
        self.recorded.lock().cache_resized.push(new_length);
    }
}

fn notification(id: u32) -> Notification {
    Notification::new(id, 0, &b"devicetoken"[..], &b"{}"[..]).unwrap()
}

fn connect(
    config: ConnectionConfig,
) -> (
    ApnsConnection<MockProvider, RecordingDelegate>,
    MockProvider,
    RecordingDelegate,
    mpsc::UnboundedSender<ChannelEvent>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let provider = MockProvider::default();
    let delegate = RecordingDelegate::default();
    let connection = ApnsConnection::new(
        provider.clone(),
        delegate.clone(),
        config,
        events_tx.clone(),
        events_rx,
    );
    (connection, provider, delegate, events_tx)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn error_frame_splits_cache_and_replays_backlog() {
    let (connection, provider, delegate, events_tx) = connect(ConnectionConfig::default());

    // Twenty notifications; the server rejects id 10 after having received
    // through id 15.
    for id in 0..=15 {
        connection.send_message(notification(id)).await.unwrap();
    }
    events_tx
        .send(ChannelEvent::DeliveryResult(DeliveryResult::new(
            DeliveryError::InvalidToken,
            10,
        )))
        .unwrap();

    // Reconcile and replay finish once the last buffered notification has
    // been resent.
    wait_until(|| delegate.recorded.lock().sent.contains(&(15, true))).await;
    for id in 16..20 {
        connection.send_message(notification(id)).await.unwrap();
    }

    let written = provider.written_identifiers();
    assert_eq!(written.len(), 2, "one reconnect after the error");
    assert_eq!(written[0], (0..=15).collect::<Vec<u32>>());
    assert_eq!(written[1], vec![11, 12, 13, 14, 15, 16, 17, 18, 19]);

    let recorded = delegate.recorded.lock();
    assert_eq!(recorded.failed, vec![Some(10)]);
    assert_eq!(recorded.resent_counts, vec![5]);
    assert_eq!(recorded.closed, vec![(DeliveryError::InvalidToken, 10)]);
    assert!(recorded.cache_resized.is_empty());
    for id in 11..=15 {
        assert!(recorded.sent.contains(&(id, true)), "id {id} replayed from buffer");
    }
    // Id 10 was reported failed exactly once and never replayed.
    assert!(!written[1].contains(&10));

    // Every identifier lands in exactly one terminal outcome: 10 failed,
    // the remaining nineteen were written on exactly one surviving
    // connection run.
    let survivors: Vec<u32> = written[0]
        .iter()
        .filter(|id| **id < 10)
        .chain(written[1].iter())
        .copied()
        .collect();
    assert_eq!(survivors.len(), 19);
}

#[tokio::test]
async fn unmatched_error_requeues_everything_and_resizes() {
    let (connection, provider, delegate, events_tx) = connect(ConnectionConfig {
        cache_length: 3,
        auto_adjust_cache_length: true,
    });

    // Six sends against a window of three: ids 0..2 evict.
    for id in 0..6 {
        connection.send_message(notification(id)).await.unwrap();
    }
    // The server rejects an identifier that already fell out of the window.
    events_tx
        .send(ChannelEvent::DeliveryResult(DeliveryResult::new(
            DeliveryError::ProcessingError,
            0,
        )))
        .unwrap();

    wait_until(|| delegate.recorded.lock().sent.contains(&(5, true))).await;

    let recorded = delegate.recorded.lock();
    assert_eq!(recorded.failed, vec![None], "failure identity unknown");
    assert_eq!(recorded.resent_counts, vec![3]);
    // Window of 3 grows by half the recovered backlog: 3 + 3/2 = 4.
    assert_eq!(recorded.cache_resized, vec![4]);
    drop(recorded);
    assert_eq!(connection.cache_length().await, 4);

    let written = provider.written_identifiers();
    assert_eq!(written[1], vec![3, 4, 5], "whole window replayed in order");
}

#[tokio::test]
async fn unmatched_error_without_auto_adjust_reports_no_resize() {
    let (connection, provider, delegate, events_tx) = connect(ConnectionConfig {
        cache_length: 3,
        auto_adjust_cache_length: false,
    });

    for id in 0..6 {
        connection.send_message(notification(id)).await.unwrap();
    }
    events_tx
        .send(ChannelEvent::DeliveryResult(DeliveryResult::new(
            DeliveryError::ProcessingError,
            0,
        )))
        .unwrap();

    wait_until(|| delegate.recorded.lock().sent.contains(&(5, true))).await;

    let recorded = delegate.recorded.lock();
    assert!(recorded.cache_resized.is_empty());
    assert_eq!(recorded.failed, vec![None]);
    drop(recorded);
    assert_eq!(connection.cache_length().await, 3);
    assert_eq!(provider.written_identifiers()[1], vec![3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn transient_write_failure_is_retried_silently() {
    let (connection, provider, delegate, _events_tx) = connect(ConnectionConfig::default());
    provider.fail_next_writes(1);

    connection.send_message(notification(1)).await.unwrap();

    let recorded = delegate.recorded.lock();
    assert_eq!(recorded.sent, vec![(1, false)]);
    assert!(recorded.failed.is_empty(), "retries below the bound stay silent");
    drop(recorded);
    assert_eq!(provider.written_identifiers(), vec![vec![1]]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_the_failure() {
    let (connection, provider, delegate, _events_tx) = connect(ConnectionConfig::default());
    provider.fail_next_writes(3);

    let error = connection.send_message(notification(1)).await.unwrap_err();
    match error {
        ApnsError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }

    let recorded = delegate.recorded.lock();
    assert_eq!(recorded.failed, vec![Some(1)]);
    assert!(recorded.sent.is_empty());
}

#[tokio::test(start_paused = true)]
async fn provider_closed_propagates_without_retry() {
    let (connection, provider, delegate, _events_tx) = connect(ConnectionConfig::default());
    provider.close().await;

    let error = connection.send_message(notification(1)).await.unwrap_err();
    assert!(matches!(error, ApnsError::ProviderClosed));
    assert!(delegate.recorded.lock().failed.is_empty());
}

#[tokio::test]
async fn close_refuses_new_sends() {
    let (connection, _provider, _delegate, _events_tx) = connect(ConnectionConfig::default());

    connection.send_message(notification(1)).await.unwrap();
    connection.close().await;

    let error = connection.send_message(notification(2)).await.unwrap_err();
    assert!(matches!(error, ApnsError::ConnectionClosed));
}

#[tokio::test]
async fn close_drains_queued_reconcile_work_first() {
    let (connection, provider, delegate, events_tx) = connect(ConnectionConfig::default());

    for id in 0..4 {
        connection.send_message(notification(id)).await.unwrap();
    }
    events_tx
        .send(ChannelEvent::DeliveryResult(DeliveryResult::new(
            DeliveryError::Shutdown,
            1,
        )))
        .unwrap();
    // Close immediately; the queued reconcile must still run to completion.
    connection.close().await;

    let recorded = delegate.recorded.lock();
    assert_eq!(recorded.failed, vec![Some(1)]);
    assert_eq!(recorded.resent_counts, vec![2]);
    // Ids 2 and 3 were replayed on a fresh connection before shutdown.
    assert_eq!(provider.written_identifiers()[1], vec![2, 3]);
}
