//! The channel provider: owns one physical connection at a time and hands
//! it out on demand.
//!
//! The connection coordinator depends only on the [`ChannelProvider`] /
//! [`PushChannel`] traits. [`StreamChannelProvider`] is the one concrete
//! adapter: it dials through a [`Connector`] (TCP, TLS, anything
//! `AsyncRead + AsyncWrite`), consults the injected [`ReconnectPolicy`]
//! before reusing a live connection, and runs a read task per connection
//! that decodes inbound error frames and reports them — together with
//! asynchronous closes — over an event channel.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::delivery::DeliveryResult;
use crate::policy::ReconnectPolicy;
use crate::wire;

/// Events the transport layer pushes to the connection's worker queue.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The server sent an error frame on some connection.
    DeliveryResult(DeliveryResult),
    /// A physical connection closed, gracefully or not. Carries the
    /// connection's generation counter.
    Closed(u64),
    /// Shutdown marker. Never sent by a provider; the connection enqueues it
    /// behind any pending events when it is closed.
    Shutdown,
}

/// Error from the provider seam.
#[derive(Debug)]
pub enum ProviderError {
    /// The provider was permanently closed. Terminal; must not be retried.
    Closed,
    /// Dialing a new connection failed.
    Connect(io::Error),
    /// I/O on the current connection failed.
    Io(io::Error),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Closed => write!(f, "channel provider has been closed"),
            ProviderError::Connect(e) => write!(f, "connect failed: {e}"),
            ProviderError::Io(e) => write!(f, "channel I/O failed: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProviderError::Closed => None,
            ProviderError::Connect(e) | ProviderError::Io(e) => Some(e),
        }
    }
}

/// A handle to one physical connection's write side.
///
/// Cheap to clone; all clones refer to the same connection. The generation
/// counter identifies the physical connection so a close request for a
/// superseded handle can be recognized as stale.
pub trait PushChannel: Clone + Send + Sync + 'static {
    /// Write one encoded frame and flush it.
    fn write_frame(&self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Identity of the underlying physical connection.
    fn generation(&self) -> u64;
}

/// Obtain-or-reconnect capability consumed by the connection coordinator.
pub trait ChannelProvider: Send + Sync + 'static {
    /// The channel handle type this provider hands out.
    type Channel: PushChannel;

    /// Obtain the current channel — reconnecting if none is live or the
    /// reconnect policy says the current one is due — and run `action`
    /// with it. Fails with [`ProviderError::Closed`] once the provider has
    /// been permanently closed.
    fn run_with_channel<F, Fut, T>(
        &self,
        action: F,
    ) -> impl Future<Output = Result<T, ProviderError>> + Send
    where
        F: FnOnce(Self::Channel) -> Fut + Send,
        Fut: Future<Output = io::Result<T>> + Send,
        T: Send;

    /// Close a specific connection if it is still the current one; a no-op
    /// for superseded handles.
    fn close_channel(&self, channel: &Self::Channel) -> impl Future<Output = ()> + Send;

    /// Terminal shutdown. Subsequent `run_with_channel` calls fail with
    /// [`ProviderError::Closed`].
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Dials new connections on demand.
pub trait Connector: Send + Sync + 'static {
    /// The byte stream this connector produces. TLS setup, certificates and
    /// addressing all live behind this type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a new connection.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Write-half handle for one stream connection.
pub struct StreamChannel<S> {
    inner: Arc<ChannelInner<S>>,
}

impl<S> Clone for StreamChannel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ChannelInner<S> {
    generation: u64,
    writer: AsyncMutex<WriteHalf<S>>,
    closed: AtomicBool,
}

impl<S> StreamChannel<S> {
    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn shutdown(&self)
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, generation = self.inner.generation, "error shutting down channel");
        }
    }
}

impl<S> PushChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed"));
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    fn generation(&self) -> u64 {
        self.inner.generation
    }
}

struct Active<S> {
    channel: StreamChannel<S>,
    reader: JoinHandle<()>,
}

struct ProviderState<S> {
    current: Option<Active<S>>,
    next_generation: u64,
    closed: bool,
}

/// [`ChannelProvider`] over any [`Connector`]-produced byte stream.
///
/// Reconnection is lazy: nothing is dialed until a channel is demanded.
pub struct StreamChannelProvider<C: Connector> {
    connector: C,
    policy: Arc<dyn ReconnectPolicy>,
    events: UnboundedSender<ChannelEvent>,
    state: AsyncMutex<ProviderState<C::Stream>>,
}

impl<C: Connector> StreamChannelProvider<C> {
    /// Create a provider. Error frames and close notifications from every
    /// connection it dials are forwarded to `events`.
    pub fn new(
        connector: C,
        policy: Arc<dyn ReconnectPolicy>,
        events: UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            connector,
            policy,
            events,
            state: AsyncMutex::new(ProviderState {
                current: None,
                next_generation: 0,
                closed: false,
            }),
        }
    }

    async fn ensure_channel(
        &self,
        state: &mut ProviderState<C::Stream>,
    ) -> Result<StreamChannel<C::Stream>, ProviderError> {
        if state.closed {
            return Err(ProviderError::Closed);
        }

        if self.policy.should_reconnect() {
            if let Some(active) = state.current.take() {
                tracing::debug!(
                    generation = active.channel.generation(),
                    "reconnect policy is due, cycling connection"
                );
                active.channel.shutdown().await;
            }
        }

        if let Some(active) = &state.current {
            if !active.channel.is_closed() {
                return Ok(active.channel.clone());
            }
            state.current = None;
        }

        let stream = self
            .connector
            .connect()
            .await
            .map_err(ProviderError::Connect)?;
        let generation = state.next_generation;
        state.next_generation += 1;

        let (read_half, write_half) = tokio::io::split(stream);
        let channel = StreamChannel {
            inner: Arc::new(ChannelInner {
                generation,
                writer: AsyncMutex::new(write_half),
                closed: AtomicBool::new(false),
            }),
        };
        let reader = tokio::spawn(read_loop(
            read_half,
            channel.clone(),
            self.events.clone(),
            generation,
        ));
        self.policy.reconnected();
        tracing::debug!(generation, "connected");

        state.current = Some(Active {
            channel: channel.clone(),
            reader,
        });
        Ok(channel)
    }
}

impl<C: Connector> ChannelProvider for StreamChannelProvider<C> {
    type Channel = StreamChannel<C::Stream>;

    async fn run_with_channel<F, Fut, T>(&self, action: F) -> Result<T, ProviderError>
    where
        F: FnOnce(Self::Channel) -> Fut + Send,
        Fut: Future<Output = io::Result<T>> + Send,
        T: Send,
    {
        let channel = {
            let mut state = self.state.lock().await;
            self.ensure_channel(&mut state).await?
        };
        action(channel).await.map_err(ProviderError::Io)
    }

    async fn close_channel(&self, channel: &Self::Channel) {
        let mut state = self.state.lock().await;
        let is_current = state
            .current
            .as_ref()
            .is_some_and(|a| a.channel.generation() == channel.generation());
        if !is_current {
            // Superseded handle; the connection it named is already gone.
            return;
        }
        if let Some(active) = state.current.take() {
            drop(state);
            tracing::debug!(generation = active.channel.generation(), "closing channel");
            active.channel.shutdown().await;
        }
    }

    async fn close(&self) {
        let active = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.current.take()
        };
        if let Some(active) = active {
            active.channel.shutdown().await;
            // The read task ends once the peer half observes the shutdown;
            // no need to wait for it here.
            drop(active.reader);
        }
    }
}

/// Per-connection read task: decode fixed-size error frames until the
/// connection dies, then report the close.
async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    channel: StreamChannel<S>,
    events: UnboundedSender<ChannelEvent>,
    generation: u64,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut frame = [0u8; wire::ERROR_FRAME_SIZE];
    loop {
        match reader.read_exact(&mut frame).await {
            Ok(_) => match wire::decode_delivery_result(&frame) {
                Ok(result) => {
                    tracing::debug!(%result, generation, "received error frame");
                    if events.send(ChannelEvent::DeliveryResult(result)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // A frame we cannot interpret leaves the stream position
                    // meaningless; this connection is done.
                    tracing::error!(error = %e, generation, "malformed inbound frame, abandoning connection");
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(generation, "connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, generation, "read failed");
                break;
            }
        }
    }
    channel.inner.closed.store(true, Ordering::SeqCst);
    let _ = events.send(ChannelEvent::Closed(generation));
}
