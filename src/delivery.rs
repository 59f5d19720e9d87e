//! Delivery error taxonomy and the per-frame delivery result.
//!
//! The server reports exactly one failure per connection: a 6-byte frame
//! naming a status code and the identifier of the rejected notification.
//! Status codes outside the documented range decode to [`DeliveryError::Unknown`]
//! so that new server codes never break the read loop.

use std::fmt;

/// Status codes the push service can report in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryError {
    /// No error (status 0). Not expected on the wire; the server only
    /// speaks up on failure.
    NoError,
    /// Internal processing error (status 1).
    ProcessingError,
    /// Notification carried no device token (status 2).
    MissingDeviceToken,
    /// Notification carried no topic (status 3).
    MissingTopic,
    /// Notification carried no payload (status 4).
    MissingPayload,
    /// Device token length field was invalid (status 5).
    InvalidTokenSize,
    /// Topic length field was invalid (status 6).
    InvalidTopicSize,
    /// Payload exceeded the protocol limit (status 7).
    InvalidPayloadSize,
    /// Device token was not valid for this environment (status 8).
    InvalidToken,
    /// Priority field was invalid (status 9).
    InvalidPriority,
    /// The server is shutting down the connection for maintenance (status 10).
    /// The referenced notification was NOT rejected; it marks the last one
    /// processed before shutdown.
    Shutdown,
    /// Any status byte this client does not know about.
    Unknown(u8),
}

impl DeliveryError {
    /// Map a raw status byte to its taxonomy entry. Total: unrecognized
    /// bytes become [`DeliveryError::Unknown`].
    pub fn from_status(status: u8) -> Self {
        match status {
            0 => DeliveryError::NoError,
            1 => DeliveryError::ProcessingError,
            2 => DeliveryError::MissingDeviceToken,
            3 => DeliveryError::MissingTopic,
            4 => DeliveryError::MissingPayload,
            5 => DeliveryError::InvalidTokenSize,
            6 => DeliveryError::InvalidTopicSize,
            7 => DeliveryError::InvalidPayloadSize,
            8 => DeliveryError::InvalidToken,
            9 => DeliveryError::InvalidPriority,
            10 => DeliveryError::Shutdown,
            other => DeliveryError::Unknown(other),
        }
    }

    /// The raw status byte for this error.
    pub fn status(&self) -> u8 {
        match self {
            DeliveryError::NoError => 0,
            DeliveryError::ProcessingError => 1,
            DeliveryError::MissingDeviceToken => 2,
            DeliveryError::MissingTopic => 3,
            DeliveryError::MissingPayload => 4,
            DeliveryError::InvalidTokenSize => 5,
            DeliveryError::InvalidTopicSize => 6,
            DeliveryError::InvalidPayloadSize => 7,
            DeliveryError::InvalidToken => 8,
            DeliveryError::InvalidPriority => 9,
            DeliveryError::Shutdown => 10,
            DeliveryError::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::NoError => write!(f, "no error"),
            DeliveryError::ProcessingError => write!(f, "processing error"),
            DeliveryError::MissingDeviceToken => write!(f, "missing device token"),
            DeliveryError::MissingTopic => write!(f, "missing topic"),
            DeliveryError::MissingPayload => write!(f, "missing payload"),
            DeliveryError::InvalidTokenSize => write!(f, "invalid token size"),
            DeliveryError::InvalidTopicSize => write!(f, "invalid topic size"),
            DeliveryError::InvalidPayloadSize => write!(f, "invalid payload size"),
            DeliveryError::InvalidToken => write!(f, "invalid token"),
            DeliveryError::InvalidPriority => write!(f, "invalid priority"),
            DeliveryError::Shutdown => write!(f, "server shutdown"),
            DeliveryError::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// A decoded error frame: one status code plus the identifier of the
/// notification the server is pointing at.
///
/// Constructed by the wire decoder, consumed once by the connection's
/// reconcile path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResult {
    /// What went wrong.
    pub error: DeliveryError,
    /// Identifier of the rejected notification.
    pub identifier: u32,
}

impl DeliveryResult {
    /// Create a delivery result.
    pub fn new(error: DeliveryError, identifier: u32) -> Self {
        Self { error, identifier }
    }
}

impl fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for notification {}", self.error, self.identifier)
    }
}
