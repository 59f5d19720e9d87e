//! The outbound notification value type.

use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::wire;

/// Maximum payload size the binary protocol accepts, in bytes.
pub const MAX_PAYLOAD_SIZE: usize = 256;

/// Which on-wire encoding a notification uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Command 1: carries identifier and expiry, eligible for error frames
    /// referencing it by identifier.
    #[default]
    Enhanced,
    /// Command 0: the oldest frame layout, no identifier or expiry on the
    /// wire. The notification still carries a caller-assigned identifier
    /// locally so the delivery cache can account for it.
    Simple,
}

/// Error constructing a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationError {
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    PayloadTooLong(usize),
    /// Device token is empty.
    EmptyDeviceToken,
    /// Device token length does not fit the 16-bit wire field.
    TokenTooLong(usize),
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::PayloadTooLong(len) => {
                write!(f, "payload is {len} bytes, limit is {MAX_PAYLOAD_SIZE}")
            }
            NotificationError::EmptyDeviceToken => write!(f, "device token is empty"),
            NotificationError::TokenTooLong(len) => {
                write!(f, "device token is {len} bytes, limit is {}", u16::MAX)
            }
        }
    }
}

impl std::error::Error for NotificationError {}

/// One outbound push message.
///
/// Immutable once constructed. The identifier is caller-assigned and must be
/// unique among in-flight notifications; the connection relies on it to
/// reconcile error frames against the sent-notification cache and never
/// deduplicates on the caller's behalf.
///
/// Clones are cheap: token, payload and the cached wire frame are shared.
#[derive(Debug, Clone)]
pub struct Notification {
    identifier: u32,
    expiry: u32,
    device_token: Bytes,
    payload: Bytes,
    format: WireFormat,
    frame: OnceLock<Bytes>,
}

impl Notification {
    /// Create an enhanced-format notification.
    ///
    /// `expiry` is epoch seconds after which the server may discard the
    /// notification instead of retrying delivery.
    pub fn new(
        identifier: u32,
        expiry: u32,
        device_token: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, NotificationError> {
        Self::with_format(WireFormat::Enhanced, identifier, expiry, device_token, payload)
    }

    /// Create a simple-format (legacy) notification.
    ///
    /// The identifier never reaches the wire in this format, but the cache
    /// still keys on it, so callers should keep it unique regardless.
    pub fn simple(
        identifier: u32,
        device_token: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, NotificationError> {
        Self::with_format(WireFormat::Simple, identifier, 0, device_token, payload)
    }

    fn with_format(
        format: WireFormat,
        identifier: u32,
        expiry: u32,
        device_token: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<Self, NotificationError> {
        let device_token = device_token.into();
        let payload = payload.into();
        if device_token.is_empty() {
            return Err(NotificationError::EmptyDeviceToken);
        }
        if device_token.len() > u16::MAX as usize {
            return Err(NotificationError::TokenTooLong(device_token.len()));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NotificationError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            identifier,
            expiry,
            device_token,
            payload,
            format,
            frame: OnceLock::new(),
        })
    }

    /// Caller-assigned identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Expiry, epoch seconds. Zero for simple-format notifications.
    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    /// Raw device token bytes.
    pub fn device_token(&self) -> &Bytes {
        &self.device_token
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Wire format this notification encodes to.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// The encoded wire frame, computed on first use and cached.
    pub fn frame(&self) -> &Bytes {
        self.frame.get_or_init(|| wire::encode_notification(self))
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "notification {} ({} byte payload)",
            self.identifier,
            self.payload.len()
        )
    }
}
