//! Crate error types.

use std::fmt;
use std::io;

use crate::delivery::DeliveryError;

/// Error surfaced by the connection to callers and, by reference, to the
/// delegate's `message_send_failed` callback.
#[derive(Debug)]
pub enum ApnsError {
    /// The send retry bound was exhausted without a successful write.
    RetriesExhausted {
        /// The last transient error observed.
        original: io::Error,
        /// Number of write attempts made.
        attempts: u32,
    },
    /// The channel provider has been permanently closed. Never retried.
    ProviderClosed,
    /// The connection itself has been shut down and admits no new sends.
    ConnectionClosed,
    /// The server rejected a specific notification with an error frame.
    Delivery(DeliveryError),
}

impl fmt::Display for ApnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApnsError::RetriesExhausted { original, attempts } => {
                write!(f, "send failed after {attempts} attempts: {original}")
            }
            ApnsError::ProviderClosed => write!(f, "the channel provider has been closed"),
            ApnsError::ConnectionClosed => write!(f, "the connection has been shut down"),
            ApnsError::Delivery(error) => write!(f, "delivery rejected: {error}"),
        }
    }
}

impl std::error::Error for ApnsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApnsError::RetriesExhausted { original, .. } => Some(original),
            _ => None,
        }
    }
}

impl From<DeliveryError> for ApnsError {
    fn from(error: DeliveryError) -> Self {
        ApnsError::Delivery(error)
    }
}
