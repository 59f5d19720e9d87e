#![deny(unsafe_code)]

//! Client for the legacy APNs binary push protocol over async byte streams.
//!
//! The binary protocol is not request/response: notifications are
//! fire-and-forget frames on a long-lived connection, and the only feedback
//! is an asynchronous 6-byte error frame naming one prior notification by
//! identifier, after which the server drops the connection. Everything
//! written after the failed notification is in an undefined state and must
//! be replayed on a fresh connection.
//!
//! This crate provides the machinery for surviving that protocol:
//!
//! - A bounded, ordered [`cache`] of sent-but-unacknowledged notifications
//!   with a split-on-match reconciliation against inbound error frames
//! - A [`connection`] coordinator that keeps the send path and the
//!   reconcile path from interleaving, and replays the undetermined backlog
//!   on a new connection in order
//! - A narrow [`provider`] seam over the transport: obtain-or-reconnect,
//!   run an action with the current channel, close. TLS setup and socket
//!   choice stay behind the [`Connector`] implementation
//!
//! Delivery is at-least-once: the protocol has no positive acknowledgment,
//! so eviction from the full cache window presumes delivery, and anything
//! not provably delivered at reconcile time is resent. Deduplication, if
//! needed, belongs to the receiving application.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use apns_stream::{
//!     ApnsConnection, Connector, ConnectionConfig, NoopDelegate, Notification,
//!     StreamChannelProvider, policy,
//! };
//! use tokio::net::TcpStream;
//! use tokio::sync::mpsc;
//!
//! struct GatewayConnector {
//!     addr: String,
//! }
//!
//! impl Connector for GatewayConnector {
//!     type Stream = TcpStream; // wrap in a TLS stream in production
//!     async fn connect(&self) -> std::io::Result<TcpStream> {
//!         TcpStream::connect(&self.addr).await
//!     }
//! }
//!
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let provider = StreamChannelProvider::new(
//!     GatewayConnector { addr: "gateway.push.example:2195".into() },
//!     Arc::new(policy::Periodic::every_half_hour()),
//!     events_tx.clone(),
//! );
//! let connection = ApnsConnection::new(
//!     provider, NoopDelegate, ConnectionConfig::default(), events_tx, events_rx,
//! );
//!
//! let notification = Notification::new(1, expiry, token, payload)?;
//! connection.send_message(notification).await?;
//! ```

pub mod cache;
pub mod connection;
pub mod delegate;
pub mod delivery;
pub mod error;
pub mod notification;
pub mod policy;
pub mod provider;
pub mod wire;

pub use cache::{CacheStore, DEFAULT_CACHE_LENGTH};
pub use connection::{ApnsConnection, ConnectionConfig};
pub use delegate::{ApnsDelegate, NoopDelegate};
pub use delivery::{DeliveryError, DeliveryResult};
pub use error::ApnsError;
pub use notification::{Notification, NotificationError, WireFormat, MAX_PAYLOAD_SIZE};
pub use policy::ReconnectPolicy;
pub use provider::{
    ChannelEvent, ChannelProvider, Connector, ProviderError, PushChannel, StreamChannel,
    StreamChannelProvider,
};
